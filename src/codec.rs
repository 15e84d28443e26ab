//! bincode helpers shared by every cluster message type
use bincode::{Decode, Encode};

use crate::error::Result;
use crate::transport::tcp_receiver::MAX_FRAME_LEN;

/// Big-endian, and no decoded container may claim more than a whole frame
pub fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_limit::<MAX_FRAME_LEN>()
}

/// Serialize for cluster communication using bincode
pub fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, wire_config())?)
}

/// Deserialize from cluster communication using bincode
pub fn decode<T: Decode<()>>(data: &[u8]) -> Result<T> {
    let (value, _) = bincode::decode_from_slice(data, wire_config())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelFrame;

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        // Rpc variant, then a u64 varint length of 1 TiB over three payload bytes
        let mut data = vec![1u8, 0xFD];
        data.extend_from_slice(&(1u64 << 40).to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);

        assert!(decode::<ChannelFrame>(&data).is_err());
    }

    #[test]
    fn test_frame_within_limit_decodes() {
        let data = encode(&ChannelFrame::Rpc(vec![7; 32])).unwrap();
        match decode::<ChannelFrame>(&data).unwrap() {
            ChannelFrame::Rpc(payload) => assert_eq!(payload, vec![7; 32]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
