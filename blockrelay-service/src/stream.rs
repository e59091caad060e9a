//! Payload stream type and test utilities.

use futures_util::stream::BoxStream;

use crate::error::Error;

/// Type alias for the byte streams produced by the relay.
pub type PayloadStream = BoxStream<'static, Result<bytes::Bytes, Error>>;

/// Collects a [`PayloadStream`] into a `Vec<u8>`.
#[cfg(test)]
pub(crate) async fn read_to_vec(mut stream: PayloadStream) -> crate::error::Result<Vec<u8>> {
    use futures_util::TryStreamExt;
    let mut payload = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        payload.extend(&chunk);
    }
    Ok(payload)
}
