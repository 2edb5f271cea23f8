use ::uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }
}

/// Expands a 16 bit assigned number on the Bluetooth base UUID. This is a
/// const fn so apps can declare their UUIDs as consts.
pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Renders a Uuid in the short, lowercase form used for cache keys and
/// events.
///
/// UUIDs derived from the Bluetooth base UUID collapse to their 16 or 32
/// bit assigned number (e.g. `180f`), anything else is the full 32 hex
/// digits without separators.
pub fn to_short_string(uuid: &Uuid) -> String {
    if let Some(v) = uuid.as_u16() {
        format!("{:04x}", v)
    } else if let Some(v) = uuid.as_u32() {
        format!("{:08x}", v)
    } else {
        format!("{:032x}", uuid.as_u128())
    }
}

/// Normalizes a UUID string as given by a driver or an application.
///
/// The result is lowercase with any `-`, `{`, `}` or whitespace removed, and
/// a full-length UUID on the Bluetooth base is shortened the same way as
/// [`to_short_string`], so `"0000180F-0000-1000-8000-00805F9B34FB"` and
/// `"180f"` name the same service.
pub fn normalize(uuid: &str) -> String {
    let stripped: String = uuid
        .chars()
        .filter(|c| !matches!(c, '-' | '{' | '}') && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if stripped.len() == 32 {
        if let Ok(value) = u128::from_str_radix(&stripped, 16) {
            return to_short_string(&Uuid::from_u128(value));
        }
    }
    stripped
}
