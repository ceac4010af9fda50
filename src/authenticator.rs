/// This will allow plugable authentication mechanisms.
///
/// The session decodes each base64 challenge of an `AUTHENTICATE` exchange, hands the raw octets
/// to [`process`](Authenticator::process) and sends the base64 encoding of the answer back.
pub trait Authenticator {
    type Response: AsRef<[u8]>;
    fn process(&self, challenge: &[u8]) -> Self::Response;
}
