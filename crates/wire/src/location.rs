//! Compact binary form of an account's location, stored per account by the
//! session store.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Gateway and channel an account is currently attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub channel_id: String,
    pub gate_id: String,
}

impl Location {
    pub fn new(channel_id: impl Into<String>, gate_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            gate_id: gate_id.into(),
        }
    }

    /// Encode as `[u16 len][channel_id][u16 len][gate_id]`, big endian.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(4 + self.channel_id.len() + self.gate_id.len());
        put_str(&mut buf, &self.channel_id)?;
        put_str(&mut buf, &self.gate_id)?;
        Ok(buf.to_vec())
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        let channel_id = take_str(&mut data)?;
        let gate_id = take_str(&mut data)?;
        Ok(Self {
            channel_id,
            gate_id,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| Error::TooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn take_str(data: &mut &[u8]) -> Result<String> {
    if data.len() < 2 {
        return Err(Error::Truncated {
            need: 2,
            have: data.len(),
        });
    }
    let len = data.get_u16() as usize;
    if data.len() < len {
        return Err(Error::Truncated {
            need: len,
            have: data.len(),
        });
    }
    let s = String::from_utf8(data[..len].to_vec())?;
    data.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_bytes() {
        let loc = Location::new("ch-1", "gateway-a");
        let bytes = loc.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0, 4]);
        assert_eq!(Location::from_bytes(&bytes).unwrap(), loc);
    }

    #[test]
    fn test_location_truncated() {
        let bytes = Location::new("ch-1", "gw").to_bytes().unwrap();
        assert!(matches!(
            Location::from_bytes(&bytes[..5]),
            Err(Error::Truncated { .. })
        ));
    }
}
