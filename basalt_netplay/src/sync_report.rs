// Post-mortem sync diagnostics.
//
// When sync reports are enabled the order manager records, for each processed
// frame, the orders it applied and the state fingerprint it computed. The
// buffer is a small ring — generating it costs time every frame, so it is
// only kept when another human participant exists to compare against (a
// desync against nobody is not diagnosable anyway).
//
// On a detected desync the whole ring is dumped through the log so players
// can diff their reports and find the first divergent frame.

use std::collections::VecDeque;

use log::error;

use basalt_protocol::{FrameNumber, SyncRecord};

/// Frames of history retained for the dump.
pub const SYNC_REPORT_FRAMES: usize = 5;

#[derive(Clone, Debug)]
struct FrameReport {
    frame: FrameNumber,
    record: SyncRecord,
    orders: Vec<String>,
}

#[derive(Debug)]
pub struct SyncReport {
    capacity: usize,
    frames: VecDeque<FrameReport>,
}

impl SyncReport {
    pub fn new(capacity: usize) -> SyncReport {
        SyncReport {
            capacity,
            frames: VecDeque::with_capacity(capacity),
        }
    }

    /// Record one processed frame: the fingerprint submitted and a summary of
    /// every order applied.
    pub fn record(&mut self, frame: FrameNumber, record: SyncRecord, orders: Vec<String>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(FrameReport {
            frame,
            record,
            orders,
        });
    }

    /// Dump the retained history, marking the divergent frame.
    pub fn dump(&self, divergent: FrameNumber) {
        error!("sync report: out of sync in frame {divergent}");
        for report in &self.frames {
            let marker = if report.frame == divergent { " <-- " } else { "" };
            error!(
                "  frame {}: checksum {:08x}, defeat {:016x}{marker}",
                report.frame, report.record.checksum, report.record.defeat
            );
            for order in &report.orders {
                error!("    {order}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
