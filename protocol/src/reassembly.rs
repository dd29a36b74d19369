//! Reassembly of responses split across several datagrams
//!
//! Servers that split a response tag every datagram with a series id, the
//! fragment index and the fragment count. Fragments can arrive in any order,
//! more than once, or not at all. [`FragmentReassembler`] buffers them per
//! series and hands back the joined payload, in index order, exactly once.
//!
//! The table is deliberately small: a target rarely has more than one or two
//! split responses in flight, so a full table means the server is misbehaving
//! and new series are dropped rather than growing without bound.

use log::{debug, warn};

/// Series tracked concurrently per target.
pub const MAX_SERIES: usize = 8;

/// Fragments buffered for one logical response.
#[derive(Debug, Clone)]
pub struct FragmentSeries {
    pub id: u32,
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl FragmentSeries {
    fn new(id: u32, count: usize) -> Self {
        Self {
            id,
            slots: vec![None; count],
            received: 0,
        }
    }

    pub fn expected_count(&self) -> usize {
        self.slots.len()
    }

    pub fn received_count(&self) -> usize {
        self.received
    }

    /// Every slot `0..expected_count` is filled.
    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    /// Stores `payload` if the slot is still empty. Returns false for duplicates.
    fn insert(&mut self, index: usize, payload: &[u8]) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(payload.to_vec());
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    /// Joins the fragments in index order.
    fn assemble(self) -> Vec<u8> {
        let total = self.slots.iter().flatten().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);

        for fragment in self.slots.into_iter().flatten() {
            out.extend_from_slice(&fragment);
        }

        out
    }
}

/// Per-target table of partially received series.
#[derive(Debug, Default, Clone)]
pub struct FragmentReassembler {
    series: Vec<FragmentSeries>,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers one fragment and returns the joined payload once the series is
    /// complete.
    ///
    /// Fragments are ignored when the index is out of range, when the declared
    /// count disagrees with the one the series was opened with, or when the
    /// table is full and `series_id` is new.
    pub fn ingest(
        &mut self,
        series_id: u32,
        fragment_index: usize,
        fragment_count: usize,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        if fragment_count == 0 || fragment_index >= fragment_count {
            warn!(
                "Fragment {}/{} of series {:#010x} is out of range",
                fragment_index, fragment_count, series_id
            );
            return None;
        }

        let pos = match self.series.iter().position(|s| s.id == series_id) {
            Some(pos) => {
                if self.series[pos].expected_count() != fragment_count {
                    warn!(
                        "Series {:#010x} declared {} fragments, now {}; ignoring fragment",
                        series_id,
                        self.series[pos].expected_count(),
                        fragment_count
                    );
                    return None;
                }
                pos
            }
            None => {
                if self.series.len() >= MAX_SERIES {
                    warn!(
                        "Fragment table full, dropping fragment of series {:#010x}",
                        series_id
                    );
                    return None;
                }
                self.series.push(FragmentSeries::new(series_id, fragment_count));
                self.series.len() - 1
            }
        };

        let series = &mut self.series[pos];
        if !series.insert(fragment_index, payload) {
            debug!(
                "Duplicate fragment {} of series {:#010x}",
                fragment_index, series_id
            );
            return None;
        }

        debug!(
            "Series {:#010x}: {}/{} fragments",
            series_id,
            series.received_count(),
            series.expected_count()
        );

        if series.is_complete() {
            Some(self.series.remove(pos).assemble())
        } else {
            None
        }
    }

    /// Number of series still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.series.len()
    }

    pub fn series(&self, series_id: u32) -> Option<&FragmentSeries> {
        self.series.iter().find(|s| s.id == series_id)
    }

    /// Discards all partial state.
    pub fn clear(&mut self) {
        self.series.clear();
    }
}
