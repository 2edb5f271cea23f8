use bitflags::bitflags;
use serde::ser::{Serialize, Serializer};

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

// The names properties are reported with on the wire, in the order they
// get listed.
const PROPERTY_NAMES: [(CharacteristicProperties, &str); 10] = [
    (CharacteristicProperties::BROADCAST, "broadcast"),
    (CharacteristicProperties::READ, "read"),
    (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, "writeWithoutResponse"),
    (CharacteristicProperties::WRITE, "write"),
    (CharacteristicProperties::NOTIFY, "notify"),
    (CharacteristicProperties::INDICATE, "indicate"),
    (CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, "authenticatedSignedWrites"),
    (CharacteristicProperties::EXTENDED_PROPERTIES, "extendedProperties"),
    (CharacteristicProperties::RELIABLE_WRITES, "reliableWrites"),
    (CharacteristicProperties::WRITABLE_AUXILIARIES, "writableAuxiliaries"),
];

impl CharacteristicProperties {
    pub fn names(&self) -> Vec<&'static str> {
        PROPERTY_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl Serialize for CharacteristicProperties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_names() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert_eq!(props.names(), vec!["read", "notify"]);
        assert!(CharacteristicProperties::NONE.names().is_empty());
    }

    #[test]
    fn properties_serialize_as_names() {
        let json = serde_json::to_string(&(CharacteristicProperties::READ | CharacteristicProperties::WRITE)).unwrap();
        assert_eq!(json, r#"["read","write"]"#);
    }
}
