//! Characteristic binding
//!
//! Maps the two OTA roles onto the characteristics enumerated from the
//! peripheral's service. The reported name decides; each role's position in
//! the reference profile is only a hint.

use std::collections::HashMap;
use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::ble::platform::{CharacteristicHandle, DiscoveredCharacteristic};
use crate::error::{OtaError, Result};

pub const WRITE_CHARACTERISTIC_INDEX: usize = 2;
pub const READ_CHARACTERISTIC_INDEX: usize = 3;

/// 0xFFF3 as the OS reports it.
pub const WRITE_CHARACTERISTIC_NAME: &str = "65523";
/// 0xFFF4 as the OS reports it.
pub const READ_CHARACTERISTIC_NAME: &str = "65524";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Write,
    Read,
}

impl Role {
    pub fn index(&self) -> usize {
        match self {
            Role::Write => WRITE_CHARACTERISTIC_INDEX,
            Role::Read => READ_CHARACTERISTIC_INDEX,
        }
    }

    pub fn default_name(&self) -> &'static str {
        match self {
            Role::Write => WRITE_CHARACTERISTIC_NAME,
            Role::Read => READ_CHARACTERISTIC_NAME,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Write => write!(f, "write"),
            Role::Read => write!(f, "read"),
        }
    }
}

/// Expected characteristic name per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacteristicNames {
    pub write: String,
    pub read: String,
}

impl Default for CharacteristicNames {
    fn default() -> Self {
        Self {
            write: WRITE_CHARACTERISTIC_NAME.to_string(),
            read: READ_CHARACTERISTIC_NAME.to_string(),
        }
    }
}

impl CharacteristicNames {
    pub fn for_role(&self, role: Role) -> &str {
        match role {
            Role::Write => &self.write,
            Role::Read => &self.read,
        }
    }
}

/// Bind `role` by position using the default expected names.
pub fn bind(discovered: &[DiscoveredCharacteristic], role: Role) -> Result<CharacteristicHandle> {
    CharacteristicBinder::default().bind(discovered, role)
}

/// Name to handle lookup, built once after enumeration.
#[derive(Debug, Clone, Default)]
pub struct CharacteristicMap {
    by_name: HashMap<String, (usize, CharacteristicHandle)>,
}

impl CharacteristicMap {
    /// First occurrence wins when a name repeats.
    pub fn build(discovered: &[DiscoveredCharacteristic]) -> Self {
        let mut by_name = HashMap::with_capacity(discovered.len());
        for (position, c) in discovered.iter().enumerate() {
            by_name.entry(c.name.clone()).or_insert((position, c.handle));
        }
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<CharacteristicHandle> {
        self.by_name.get(name).map(|(_, handle)| *handle)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).map(|(position, _)| *position)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Both roles after a successful resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bindings {
    pub write: CharacteristicHandle,
    /// Absent when the peripheral exposes no read characteristic.
    pub read: Option<CharacteristicHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct CharacteristicBinder {
    names: CharacteristicNames,
}

impl CharacteristicBinder {
    pub fn new(names: CharacteristicNames) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &CharacteristicNames {
        &self.names
    }

    /// Strict positional bind: the characteristic at the role's index must
    /// carry the expected name.
    pub fn bind(
        &self,
        discovered: &[DiscoveredCharacteristic],
        role: Role,
    ) -> Result<CharacteristicHandle> {
        let index = role.index();
        let expected = self.names.for_role(role);
        let found = discovered
            .get(index)
            .ok_or(OtaError::CharacteristicOutOfRange {
                role,
                index,
                len: discovered.len(),
            })?;

        if found.name != expected {
            return Err(OtaError::CharacteristicMismatch {
                role,
                index,
                expected: expected.to_string(),
                found: found.name.clone(),
            });
        }
        Ok(found.handle)
    }

    /// Resolve both roles by name. Write is required, Read is optional.
    pub fn resolve(&self, discovered: &[DiscoveredCharacteristic]) -> Result<Bindings> {
        let map = CharacteristicMap::build(discovered);

        let write = match self.lookup(&map, discovered, Role::Write) {
            Some(handle) => handle,
            None => {
                let index = Role::Write.index();
                return Err(match discovered.get(index) {
                    Some(found) => OtaError::CharacteristicMismatch {
                        role: Role::Write,
                        index,
                        expected: self.names.write.clone(),
                        found: found.name.clone(),
                    },
                    None => OtaError::CharacteristicOutOfRange {
                        role: Role::Write,
                        index,
                        len: discovered.len(),
                    },
                });
            }
        };

        let read = self.lookup(&map, discovered, Role::Read);
        if read.is_none() {
            warn!(
                "No {:?} characteristic; read-back verification disabled",
                self.names.read
            );
        }

        Ok(Bindings { write, read })
    }

    fn lookup(
        &self,
        map: &CharacteristicMap,
        discovered: &[DiscoveredCharacteristic],
        role: Role,
    ) -> Option<CharacteristicHandle> {
        let name = self.names.for_role(role);
        let handle = map.get(name)?;

        if let Some(position) = map.position(name) {
            if position != role.index() {
                let hinted = discovered
                    .get(role.index())
                    .map(|c| c.name.as_str())
                    .unwrap_or("<none>");
                debug!(
                    "{} characteristic {:?} found at index {}, index {} holds {:?}",
                    role,
                    name,
                    position,
                    role.index(),
                    hinted
                );
            }
        }
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::platform::short_uuid;
    use uuid::Uuid;

    fn characteristic(name: &str, n: u16) -> DiscoveredCharacteristic {
        DiscoveredCharacteristic {
            name: name.to_string(),
            handle: CharacteristicHandle {
                service: short_uuid(0xFFF0),
                uuid: short_uuid(n),
            },
        }
    }

    fn reference_profile() -> Vec<DiscoveredCharacteristic> {
        (0xFFF1..=0xFFF5)
            .map(|n| DiscoveredCharacteristic::new(short_uuid(0xFFF0), short_uuid(n)))
            .collect()
    }

    fn names(write: &str) -> CharacteristicNames {
        CharacteristicNames {
            write: write.to_string(),
            read: READ_CHARACTERISTIC_NAME.to_string(),
        }
    }

    #[test]
    fn test_bind_reference_profile() {
        let chars = reference_profile();
        assert_eq!(bind(&chars, Role::Write).unwrap().uuid, short_uuid(0xFFF3));
        assert_eq!(bind(&chars, Role::Read).unwrap().uuid, short_uuid(0xFFF4));
    }

    #[test]
    fn test_bind_expected_name_at_index() {
        let chars = vec![
            characteristic("A", 1),
            characteristic("B", 2),
            characteristic("expected_write_name", 3),
        ];
        let binder = CharacteristicBinder::new(names("expected_write_name"));
        assert_eq!(binder.bind(&chars, Role::Write).unwrap(), chars[2].handle);
    }

    #[test]
    fn test_bind_wrong_name_is_mismatch() {
        let chars = vec![
            characteristic("A", 1),
            characteristic("B", 2),
            characteristic("wrong", 3),
        ];
        let binder = CharacteristicBinder::new(names("expected_write_name"));
        match binder.bind(&chars, Role::Write) {
            Err(OtaError::CharacteristicMismatch {
                role,
                index,
                expected,
                found,
            }) => {
                assert_eq!(role, Role::Write);
                assert_eq!(index, 2);
                assert_eq!(expected, "expected_write_name");
                assert_eq!(found, "wrong");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bind_out_of_range() {
        let chars = vec![characteristic("A", 1), characteristic("B", 2)];
        let err = bind(&chars, Role::Write).unwrap_err();
        assert!(matches!(
            err,
            OtaError::CharacteristicOutOfRange {
                role: Role::Write,
                index: 2,
                len: 2
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_resolve_by_name_when_position_moves() {
        // An extra characteristic shifts everything one slot to the right.
        let mut chars = vec![DiscoveredCharacteristic::new(
            short_uuid(0xFFF0),
            Uuid::from_u128(0x4a650040_b7e4_4b91_a032_5f6c9a1d7e3a),
        )];
        chars.extend(reference_profile());

        let binder = CharacteristicBinder::default();
        assert!(binder.bind(&chars, Role::Write).is_err());

        let bindings = binder.resolve(&chars).unwrap();
        assert_eq!(bindings.write.uuid, short_uuid(0xFFF3));
        assert_eq!(bindings.read.map(|h| h.uuid), Some(short_uuid(0xFFF4)));
    }

    #[test]
    fn test_resolve_without_read() {
        let chars: Vec<_> = [0xFFF1, 0xFFF2, 0xFFF3]
            .into_iter()
            .map(|n| DiscoveredCharacteristic::new(short_uuid(0xFFF0), short_uuid(n)))
            .collect();
        let bindings = CharacteristicBinder::default().resolve(&chars).unwrap();
        assert_eq!(bindings.write.uuid, short_uuid(0xFFF3));
        assert!(bindings.read.is_none());
    }

    #[test]
    fn test_resolve_missing_write_reports_slot() {
        let chars = vec![
            characteristic("A", 1),
            characteristic("B", 2),
            characteristic("wrong", 3),
        ];
        let err = CharacteristicBinder::new(names("expected_write_name"))
            .resolve(&chars)
            .unwrap_err();
        assert!(matches!(err, OtaError::CharacteristicMismatch { ref found, .. } if found == "wrong"));

        let err = CharacteristicBinder::default().resolve(&[]).unwrap_err();
        assert!(matches!(err, OtaError::CharacteristicOutOfRange { len: 0, .. }));
    }

    #[test]
    fn test_map_keeps_first_duplicate() {
        let chars = vec![characteristic("X", 1), characteristic("X", 2)];
        let map = CharacteristicMap::build(&chars);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("X"), Some(chars[0].handle));
        assert_eq!(map.position("X"), Some(0));
        assert!(map.get("Y").is_none());
    }
}
