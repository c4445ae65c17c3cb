//! Reader capability algebra (§4.4).

use crate::driver::Driver;
use crate::error::SelectWriterError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Write,
    Display,
    Removable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Write => "write",
            Capability::Display => "display",
            Capability::Removable => "removable",
        };
        f.write_str(s)
    }
}

/// True iff `r` advertises `c` among its capabilities.
pub fn has_capability<D: Driver + ?Sized>(r: &D, c: Capability) -> bool {
    r.capabilities().contains(&c)
}

/// Preserves input order; skips any `None` entries (a reader slot that
/// failed to construct), keeping only readers advertising `c`.
pub fn filter_by_capability<'a, D: Driver + ?Sized>(
    readers: &'a [Option<Box<D>>],
    c: Capability,
) -> Vec<&'a D> {
    readers
        .iter()
        .filter_map(|slot| slot.as_deref())
        .filter(|r| has_capability(r, c))
        .collect()
}

/// Finds the reader whose `reader_id()` matches `id`, in priority order:
/// `NotFound` (no such id) -> `NotConnected` -> `NoWriteCapability`.
pub fn select_writer_strict<'a, D: Driver + ?Sized>(
    readers: &'a [Option<Box<D>>],
    id: &str,
) -> Result<&'a D, SelectWriterError> {
    let found = readers
        .iter()
        .filter_map(|slot| slot.as_deref())
        .find(|r| r.reader_id() == id)
        .ok_or(SelectWriterError::NotFound)?;

    if !found.connected() {
        return Err(SelectWriterError::NotConnected);
    }
    if !has_capability(found, Capability::Write) {
        return Err(SelectWriterError::NoWriteCapability);
    }
    Ok(found)
}

/// Picks the first preferred id that is write-capable; else the first
/// write-capable reader at all. Empty preferred-id strings are skipped.
pub fn select_writer_preferred<'a, D: Driver + ?Sized>(
    readers: &'a [Option<Box<D>>],
    preferred_ids: &[String],
) -> Result<&'a D, SelectWriterError> {
    let writable: Vec<&D> = filter_by_capability(readers, Capability::Write);

    for pref in preferred_ids.iter().filter(|p| !p.is_empty()) {
        if let Some(r) = writable.iter().find(|r| r.reader_id() == *pref) {
            return Ok(*r);
        }
    }

    writable
        .first()
        .copied()
        .ok_or(SelectWriterError::NoWriters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverMetadata;
    use crate::error::{DriverOpenError, WriteError};
    use crate::token::Token;
    use std::collections::HashSet;

    struct FakeDriver {
        id: String,
        connected: bool,
        caps: HashSet<Capability>,
    }

    impl Driver for FakeDriver {
        fn metadata(&self) -> DriverMetadata {
            DriverMetadata {
                id: "fake",
                description: "test double",
                default_enabled: true,
                default_auto_detect: false,
            }
        }
        fn ids(&self) -> &'static [&'static str] {
            &["fake"]
        }
        fn open(
            &mut self,
            _device: &str,
            _sink: crossbeam_channel::Sender<crate::token::Scan>,
        ) -> Result<(), DriverOpenError> {
            unimplemented!()
        }
        fn close(&mut self) {}
        fn detect(&self, _currently_connected: &[String]) -> Option<String> {
            None
        }
        fn device(&self) -> String {
            String::new()
        }
        fn connected(&self) -> bool {
            self.connected
        }
        fn info(&self) -> String {
            String::new()
        }
        fn write(&mut self, _text: &str) -> Result<Token, WriteError> {
            unimplemented!()
        }
        fn cancel_write(&mut self) {}
        fn capabilities(&self) -> HashSet<Capability> {
            self.caps.clone()
        }
        fn reader_id(&self) -> String {
            self.id.clone()
        }
    }

    fn fake(id: &str, connected: bool, caps: &[Capability]) -> Option<Box<dyn Driver>> {
        Some(Box::new(FakeDriver {
            id: id.to_string(),
            connected,
            caps: caps.iter().copied().collect(),
        }))
    }

    #[test]
    fn filter_preserves_order_and_skips_none() {
        let readers: Vec<Option<Box<dyn Driver>>> = vec![
            fake("a", true, &[Capability::Write]),
            None,
            fake("b", true, &[]),
            fake("c", true, &[Capability::Write, Capability::Display]),
        ];
        let writers = filter_by_capability(&readers, Capability::Write);
        let ids: Vec<String> = writers.iter().map(|r| r.reader_id()).collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn select_strict_priority_order() {
        let readers: Vec<Option<Box<dyn Driver>>> = vec![fake("a", false, &[Capability::Write])];
        assert_eq!(
            select_writer_strict(&readers, "missing").unwrap_err(),
            SelectWriterError::NotFound
        );
        assert_eq!(
            select_writer_strict(&readers, "a").unwrap_err(),
            SelectWriterError::NotConnected
        );

        let readers2: Vec<Option<Box<dyn Driver>>> = vec![fake("a", true, &[])];
        assert_eq!(
            select_writer_strict(&readers2, "a").unwrap_err(),
            SelectWriterError::NoWriteCapability
        );
    }

    #[test]
    fn select_preferred_falls_back_and_skips_empty() {
        let readers: Vec<Option<Box<dyn Driver>>> = vec![
            fake("a", true, &[Capability::Write]),
            fake("b", true, &[Capability::Write]),
        ];
        let preferred = vec!["".to_string(), "b".to_string()];
        let chosen = select_writer_preferred(&readers, &preferred).unwrap();
        assert_eq!(chosen.reader_id(), "b");

        let no_match = vec!["z".to_string()];
        let chosen2 = select_writer_preferred(&readers, &no_match).unwrap();
        assert_eq!(chosen2.reader_id(), "a");
    }

    #[test]
    fn select_preferred_no_writers() {
        let readers: Vec<Option<Box<dyn Driver>>> = vec![fake("a", true, &[])];
        assert_eq!(
            select_writer_preferred(&readers, &[]).unwrap_err(),
            SelectWriterError::NoWriters
        );
    }
}
