//! Link fragmentation scans to the scans their precursor ions were selected from.
//!
//! A natively reported precursor reference is trusted when it points at an
//! earlier scan of the next-lower MS order. Otherwise the nearest preceding scan
//! of that order is used. Scans with no such predecessor are left unresolved.
use std::collections::HashMap;
use std::convert::Infallible;

use log::debug;

use crate::spectrum::ScanRecord;

/// The minimal view of a scan the resolver needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHeader {
    pub one_based_scan_number: u32,
    pub ms_order: u8,
}

impl From<&ScanRecord> for ScanHeader {
    fn from(value: &ScanRecord) -> Self {
        Self {
            one_based_scan_number: value.one_based_scan_number(),
            ms_order: value.ms_order(),
        }
    }
}

/// Anything that can report scan headers by position in file order
pub trait ScanHeaderSource {
    type Error;

    /// The header of the scan at `position`, or `None` if that scan can not be
    /// read and is not part of the scan sequence
    fn header_at(&mut self, position: usize) -> Result<Option<ScanHeader>, Self::Error>;

    fn position_of_native_id(&self, native_id: &str) -> Option<usize>;

    fn position_of_scan_number(&self, scan_number: u32) -> Option<usize>;
}

/// Resolve the precursor scan number for `scan`, which is at `position` in
/// `source`.
///
/// Survey scans have no precursor and yield `None`.
pub fn resolve_precursor<S: ScanHeaderSource + ?Sized>(
    source: &mut S,
    position: usize,
    scan: &ScanRecord,
) -> Result<Option<u32>, S::Error> {
    let ms_order = scan.ms_order();
    if ms_order < 2 {
        return Ok(None);
    }
    let expected_order = ms_order - 1;
    let scan_number = scan.one_based_scan_number();

    let native_position = scan
        .one_based_precursor_scan_number()
        .and_then(|n| source.position_of_scan_number(n))
        .or_else(|| {
            scan.native_precursor_id()
                .and_then(|id| source.position_of_native_id(id))
        });

    if let Some(candidate) = native_position {
        if candidate < position {
            if let Some(header) = source.header_at(candidate)? {
                if header.ms_order == expected_order && header.one_based_scan_number < scan_number {
                    return Ok(Some(header.one_based_scan_number));
                }
            }
        }
        debug!(
            "Scan {scan_number} reports an invalid precursor reference, searching backwards"
        );
    }

    for candidate in (0..position).rev() {
        if let Some(header) = source.header_at(candidate)? {
            if header.ms_order == expected_order {
                return Ok(Some(header.one_based_scan_number));
            }
        }
    }
    debug!("No MS{expected_order} scan precedes scan {scan_number}");
    Ok(None)
}

/// A [`ScanHeaderSource`] over scans already held in memory
pub struct LoadedScans<'a> {
    scans: &'a [ScanRecord],
    native_ids: HashMap<&'a str, usize>,
}

impl<'a> LoadedScans<'a> {
    pub fn new(scans: &'a [ScanRecord]) -> Self {
        let native_ids = scans
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.native_id().is_empty())
            .map(|(i, s)| (s.native_id(), i))
            .collect();
        Self { scans, native_ids }
    }
}

impl ScanHeaderSource for LoadedScans<'_> {
    type Error = Infallible;

    fn header_at(&mut self, position: usize) -> Result<Option<ScanHeader>, Self::Error> {
        Ok(self.scans.get(position).map(ScanHeader::from))
    }

    fn position_of_native_id(&self, native_id: &str) -> Option<usize> {
        self.native_ids.get(native_id).copied()
    }

    fn position_of_scan_number(&self, scan_number: u32) -> Option<usize> {
        self.scans
            .binary_search_by_key(&scan_number, |s| s.one_based_scan_number())
            .ok()
    }
}

/// Resolve the precursor of every fragmentation scan in `scans`, which must be
/// in file order. Survey scans are left untouched.
pub fn resolve_all(scans: &mut [ScanRecord]) {
    let resolved: Vec<(usize, Option<u32>)> = {
        let mut source = LoadedScans::new(scans);
        scans
            .iter()
            .enumerate()
            .filter(|(_, s)| s.ms_order() > 1)
            .map(|(i, s)| match resolve_precursor(&mut source, i, s) {
                Ok(link) => (i, link),
                Err(e) => match e {},
            })
            .collect()
    };
    for (i, link) in resolved {
        scans[i].set_one_based_precursor_scan_number(link);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spectrum::{Polarity, Spectrum};

    fn scan(n: u32, ms_order: u8) -> ScanRecord {
        let spectrum = Spectrum::new(vec![100.0], vec![1.0]).unwrap();
        ScanRecord::new(spectrum, n, ms_order, true, Polarity::Positive, n as f64)
            .with_native_id(format!("scan={n}"))
    }

    #[test_log::test]
    fn test_fallback_to_nearest_survey() {
        let mut scans = vec![scan(1, 1), scan(2, 2), scan(3, 1), scan(4, 2), scan(5, 3)];
        resolve_all(&mut scans);
        assert_eq!(scans[0].one_based_precursor_scan_number(), None);
        assert_eq!(scans[1].one_based_precursor_scan_number(), Some(1));
        assert_eq!(scans[3].one_based_precursor_scan_number(), Some(3));
        assert_eq!(scans[4].one_based_precursor_scan_number(), Some(4));
    }

    #[test_log::test]
    fn test_native_reference() {
        let mut scans = vec![
            scan(1, 1),
            scan(2, 1),
            scan(3, 2).with_native_precursor_scan_number(Some(1)),
            scan(4, 2).with_native_precursor_id(Some("scan=1".to_string())),
        ];
        resolve_all(&mut scans);
        assert_eq!(scans[2].one_based_precursor_scan_number(), Some(1));
        assert_eq!(scans[3].one_based_precursor_scan_number(), Some(1));
    }

    #[test_log::test]
    fn test_invalid_native_reference() {
        let mut scans = vec![
            scan(1, 1),
            scan(2, 2),
            // Points at an MS2 scan
            scan(3, 2).with_native_precursor_scan_number(Some(2)),
            // Points forward
            scan(4, 2).with_native_precursor_id(Some("scan=5".to_string())),
            scan(5, 1),
            // Points at a scan that does not exist
            scan(6, 2).with_native_precursor_scan_number(Some(42)),
        ];
        resolve_all(&mut scans);
        assert_eq!(scans[2].one_based_precursor_scan_number(), Some(1));
        assert_eq!(scans[3].one_based_precursor_scan_number(), Some(1));
        assert_eq!(scans[5].one_based_precursor_scan_number(), Some(5));
    }

    #[test_log::test]
    fn test_no_preceding_survey() {
        let mut scans = vec![
            scan(1, 2).with_native_precursor_scan_number(Some(7)),
            scan(2, 1),
        ];
        resolve_all(&mut scans);
        assert_eq!(scans[0].one_based_precursor_scan_number(), None);
        assert_eq!(scans[1].one_based_precursor_scan_number(), None);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut scans = vec![scan(1, 1), scan(2, 2), scan(3, 2)];
        resolve_all(&mut scans);
        let first = scans.clone();
        resolve_all(&mut scans);
        assert_eq!(first, scans);
    }
}
