//! bincode helpers.
//!
//! Every payload this crate moves between processes (command streams,
//! information objects, wire messages) goes through these two functions so
//! that all of them share one bincode configuration.

use crate::error::Error;

/// Encodes `value` with the crate's bincode configuration.
pub fn encode<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: bincode::Encode,
{
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::MalformedData(format!("bincode encode: {e}")))
}

/// Decodes a complete `T` from `data`. Trailing bytes are an error.
pub fn decode<T>(data: &[u8]) -> Result<T, Error>
where
    T: bincode::Decode<()>,
{
    let (value, len) = bincode::decode_from_slice::<T, _>(data, bincode::config::standard())
        .map_err(|e| Error::MalformedData(format!("bincode: {e}")))?;
    if len != data.len() {
        return Err(Error::MalformedData(format!(
            "{} trailing bytes after payload",
            data.len() - len
        )));
    }
    Ok(value)
}
