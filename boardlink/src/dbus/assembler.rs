//! Reassembly of multi-line signal records.

use log::{trace, warn};

use super::catalog::{self, DbusValue, SignalCatalog};
use crate::error::ProtocolViolation;

/// One delivered signal with its decoded results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRecord {
    /// Signal member name.
    pub name: String,

    /// Results in the order they were printed.
    pub results: Vec<DbusValue>,
}

impl SignalRecord {
    /// Create a record.
    pub fn new(name: impl Into<String>, results: Vec<DbusValue>) -> Self {
        Self {
            name: name.into(),
            results,
        }
    }
}

/// A record whose results are still arriving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSignal {
    pub name: String,
    pub expected_arity: usize,
    pub results: Vec<DbusValue>,
}

impl PendingSignal {
    fn remaining(&self) -> usize {
        self.expected_arity.saturating_sub(self.results.len())
    }
}

/// State machine turning header and result lines into [`SignalRecord`]s.
///
/// Idle until a header names a signal known to the catalog, then collects
/// that signal's number of results and emits the record. At most one record
/// is in flight.
///
/// A known header arriving while results are still expected discards the
/// partial record, starts over with the new signal and reports
/// [`ProtocolViolation::HeaderDuringAccumulation`].
#[derive(Debug, Default)]
pub struct SignalAssembler {
    pending: Option<PendingSignal>,
}

impl SignalAssembler {
    /// Create an idle assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record being collected, if any.
    pub fn pending(&self) -> Option<&PendingSignal> {
        self.pending.as_ref()
    }

    /// Drop any partial record.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Consume one line.
    ///
    /// Returns the completed record, if this line completed one. Lines that
    /// are neither a known header nor a result while collecting are ignored.
    pub fn feed(
        &mut self,
        line: &str,
        catalog: &SignalCatalog,
    ) -> Result<Option<SignalRecord>, ProtocolViolation> {
        if let Some(name) = catalog::parse_header(line) {
            let Some(arity) = catalog.arity(name) else {
                trace!("ignoring unknown signal '{}'", name);
                return Ok(None);
            };

            let previous = self.pending.replace(PendingSignal {
                name: name.to_string(),
                expected_arity: arity,
                results: Vec::with_capacity(arity),
            });

            if let Some(previous) = previous {
                let violation = ProtocolViolation::HeaderDuringAccumulation {
                    pending: previous.name,
                    received: name.to_string(),
                    collected: previous.results.len(),
                };
                warn!("{}", violation);
                return Err(violation);
            }
            trace!("collecting {} result(s) for '{}'", arity, name);
            return Ok(None);
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        let Some(value) = DbusValue::decode(line) else {
            return Ok(None);
        };

        pending.results.push(value);
        if pending.remaining() > 0 {
            return Ok(None);
        }

        Ok(self
            .pending
            .take()
            .map(|done| SignalRecord::new(done.name, done.results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str) -> String {
        format!(
            "signal time=1.0 sender=:1.7 -> destination=(null destination) serial=9 \
             path=/instance; interface=org.firmwaremanager.FirmwareInterface; member={name}"
        )
    }

    #[test]
    fn test_single_result_record() {
        let catalog = SignalCatalog::firmware_manager();
        let mut assembler = SignalAssembler::new();

        assert_eq!(assembler.feed(&header("newFirmwareAvailable"), &catalog), Ok(None));
        let record = assembler.feed(r#"   string "12345""#, &catalog).unwrap();
        assert_eq!(
            record,
            Some(SignalRecord::new("newFirmwareAvailable", vec!["12345".into()]))
        );
        assert!(assembler.pending().is_none());
    }

    #[test]
    fn test_two_result_record() {
        let catalog = SignalCatalog::firmware_manager();
        let mut assembler = SignalAssembler::new();

        assembler.feed(&header("forcedPackageChecked"), &catalog).unwrap();
        assert_eq!(assembler.feed(r#"   string "ui-pack""#, &catalog), Ok(None));
        assert_eq!(assembler.pending().map(|p| p.results.len()), Some(1));

        let record = assembler.feed("   boolean true", &catalog).unwrap().unwrap();
        assert_eq!(record.name, "forcedPackageChecked");
        assert_eq!(record.results, vec!["ui-pack".into(), true.into()]);
    }

    #[test]
    fn test_results_without_header_are_ignored() {
        let catalog = SignalCatalog::firmware_manager();
        let mut assembler = SignalAssembler::new();
        assert_eq!(assembler.feed("   boolean true", &catalog), Ok(None));
        assert!(assembler.pending().is_none());
    }

    #[test]
    fn test_unknown_signal_is_ignored() {
        let catalog = SignalCatalog::firmware_manager();
        let mut assembler = SignalAssembler::new();
        assert_eq!(assembler.feed(&header("NameAcquired"), &catalog), Ok(None));
        assert_eq!(assembler.feed(r#"   string ":1.9""#, &catalog), Ok(None));
        assert!(assembler.pending().is_none());
    }

    #[test]
    fn test_header_mid_record_restarts() {
        let catalog = SignalCatalog::firmware_manager();
        let mut assembler = SignalAssembler::new();

        assembler.feed(&header("packageUpdateState"), &catalog).unwrap();
        assembler.feed(r#"   string "ui-pack""#, &catalog).unwrap();

        let violation = assembler
            .feed(&header("firmwareUpdateState"), &catalog)
            .unwrap_err();
        assert_eq!(
            violation,
            ProtocolViolation::HeaderDuringAccumulation {
                pending: "packageUpdateState".into(),
                received: "firmwareUpdateState".into(),
                collected: 1,
            }
        );

        let record = assembler
            .feed(r#"   string "Kernel Update Started""#, &catalog)
            .unwrap()
            .unwrap();
        assert_eq!(record.name, "firmwareUpdateState");
        assert_eq!(record.results, vec!["Kernel Update Started".into()]);
    }

    #[test]
    fn test_other_lines_do_not_disturb_collection() {
        let catalog = SignalCatalog::firmware_manager();
        let mut assembler = SignalAssembler::new();

        assembler.feed(&header("newPackageAvailable"), &catalog).unwrap();
        assembler.feed(r#"   string "ui-pack""#, &catalog).unwrap();
        assert_eq!(assembler.feed("[  42.1] eth0: link up", &catalog), Ok(None));
        let record = assembler.feed(r#"   string "17""#, &catalog).unwrap().unwrap();
        assert_eq!(record.results.len(), 2);
    }
}
