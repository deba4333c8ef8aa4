use crate::error::{OmnidexError, OmnidexResult};
use bytes::{BufMut, BytesMut};

/// A decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> OmnidexResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(OmnidexError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_be_bytes(data), 4))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> OmnidexResult<DecodedData<u64>> {
        if bytes.len() < 8 {
            return Err(OmnidexError::Internal(format!(
                "bytes length {} is less than 8",
                bytes.len()
            )));
        }
        let data = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];
        Ok((u64::from_be_bytes(data), 8))
    }

    pub fn encode_i64(data: i64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> OmnidexResult<DecodedData<i64>> {
        if bytes.len() < 8 {
            return Err(OmnidexError::Internal(format!(
                "bytes length {} is less than 8",
                bytes.len()
            )));
        }
        let data = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];
        Ok((i64::from_be_bytes(data), 8))
    }
}

/// Fixed-width string fields: UTF-8 bytes right-padded with zeros.
/// Values longer than the declared width are truncated on a char boundary.
pub struct FieldCodec;

impl FieldCodec {
    pub fn encode_padded(value: &str, width: usize, buf: &mut BytesMut) {
        let mut bytes = value.as_bytes();
        if bytes.len() > width {
            let mut end = width;
            while end > 0 && !value.is_char_boundary(end) {
                end -= 1;
            }
            bytes = &value.as_bytes()[..end];
        }
        buf.put_slice(bytes);
        buf.put_bytes(0, width - bytes.len());
    }

    pub fn decode_padded(bytes: &[u8]) -> String {
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_codec_round_trip() {
        assert_eq!(
            7u32,
            CommonCodec::decode_u32(&CommonCodec::encode_u32(7)).unwrap().0
        );
        assert_eq!(
            7u64,
            CommonCodec::decode_u64(&CommonCodec::encode_u64(7)).unwrap().0
        );
        assert_eq!(
            -7i64,
            CommonCodec::decode_i64(&CommonCodec::encode_i64(-7)).unwrap().0
        );
    }

    #[test]
    fn padded_field_round_trip() {
        let mut buf = BytesMut::new();
        FieldCodec::encode_padded("abc", 8, &mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(FieldCodec::decode_padded(&buf), "abc");
    }

    #[test]
    fn overlong_field_truncates_on_char_boundary() {
        let mut buf = BytesMut::new();
        FieldCodec::encode_padded("añejo", 3, &mut buf);
        assert_eq!(buf.len(), 3);
        // The two-byte ñ does not fit after 'a'; decoding stays valid UTF-8.
        assert_eq!(FieldCodec::decode_padded(&buf), "añ");
    }
}
