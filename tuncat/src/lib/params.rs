//! The wire representation of the parameter unit's 4-byte trailer
//! (SPEC_FULL.md §6): `ifmode:u8`, `compflag:u8`, `max_frame_size:u16be`.

use bytestruct::int_enum;
use bytestruct_derive::{ByteStruct, Size};

int_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TunnelModeWire: u8 {
        L3 = 1,
        L2 = 2,
    }
}

int_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CompressFlagWire: u8 {
        Unspecified = 0,
        None = 1,
        Compress = 2,
    }
}

/// The 4-byte payload that follows a length-0 unit.
#[derive(Debug, Clone, ByteStruct, Size)]
#[big_endian]
pub struct TransportParameters {
    pub ifmode: TunnelModeWire,
    pub compflag: CompressFlagWire,
    pub max_frame_size: u16,
}

#[cfg(test)]
mod test {
    use super::*;
    use bytestruct::{ReadFrom, WriteTo};

    #[test]
    fn round_trips_through_bytes() {
        let params = TransportParameters {
            ifmode: TunnelModeWire::L3,
            compflag: CompressFlagWire::None,
            max_frame_size: 65535,
        };

        let mut buf = Vec::new();
        params.write_to(&mut buf).unwrap();
        assert_eq!(buf, vec![1u8, 1u8, 0xff, 0xff]);

        let decoded = TransportParameters::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded.ifmode, TunnelModeWire::L3);
        assert_eq!(decoded.compflag, CompressFlagWire::None);
        assert_eq!(decoded.max_frame_size, 65535);
    }

    #[test]
    fn rejects_an_unknown_discriminant() {
        let buf = [9u8, 1u8, 0, 1];
        assert!(TransportParameters::read_from(&mut &buf[..]).is_err());
    }
}
