use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The two ports a workflow may bind (e.g. app server and debugger).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub primary: u16,
    pub secondary: u16,
}

impl PortPair {
    /// Ports owned by slot `index`, or `None` if they would overflow.
    pub fn for_slot(base_port: u16, index: usize) -> Option<Self> {
        let offset = u16::try_from(index.checked_mul(2)?).ok()?;
        let primary = base_port.checked_add(offset)?;
        let secondary = primary.checked_add(1)?;
        Some(Self { primary, secondary })
    }

    pub fn overlaps(&self, other: &PortPair) -> bool {
        let mine = [self.primary, self.secondary];
        mine.contains(&other.primary) || mine.contains(&other.secondary)
    }
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.primary, self.secondary)
    }
}

/// Exclusive pairing of a workspace and a port pair to one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLease {
    pub workflow_id: String,
    pub slot: usize,
    pub workspace: PathBuf,
    pub branch: String,
    pub ports: PortPair,
    pub acquired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_for_slot() {
        assert_eq!(
            PortPair::for_slot(41000, 0),
            Some(PortPair {
                primary: 41000,
                secondary: 41001
            })
        );
        assert_eq!(
            PortPair::for_slot(41000, 3),
            Some(PortPair {
                primary: 41006,
                secondary: 41007
            })
        );
        assert_eq!(PortPair::for_slot(65534, 1), None);
        assert_eq!(PortPair::for_slot(65534, 0).unwrap().secondary, 65535);
    }

    #[test]
    fn test_adjacent_slots_do_not_overlap() {
        let a = PortPair::for_slot(41000, 0).unwrap();
        let b = PortPair::for_slot(41000, 1).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&a));
        assert_eq!(b.to_string(), "41002/41003");
    }
}
