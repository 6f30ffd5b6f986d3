//! Session id generation.

use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

/// Length of a session id on the wire.
pub(crate) const SID_LEN: usize = 20;

/// Generate a new session id: an MD5 of the remote address, the current time
/// and two random words, url-base64 encoded and truncated to 20 characters.
pub(crate) fn generate(seed: &str) -> String {
    let material = format!(
        "{} {:?} {} {}",
        seed,
        SystemTime::now(),
        rand::random::<u32>(),
        rand::random::<u32>()
    );
    let digest = md5::compute(material.as_bytes());
    let mut sid = URL_SAFE.encode(digest.0);
    sid.truncate(SID_LEN);
    sid
}
