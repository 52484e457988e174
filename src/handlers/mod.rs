pub mod config;
pub mod quota;
pub mod sessions;

pub use config::*;
pub use quota::*;
pub use sessions::*;

use crate::session::identity::{identity_key, FINGERPRINT_HEADER};
use actix_web::HttpRequest;

/// Identity key of the caller: real client address plus fingerprint header.
pub fn caller_identity(req: &HttpRequest) -> String {
    let connection = req.connection_info();
    let fingerprint = req
        .headers()
        .get(FINGERPRINT_HEADER)
        .and_then(|value| value.to_str().ok());
    identity_key(connection.realip_remote_addr(), fingerprint)
}
