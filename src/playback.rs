//! Directory playbacks and polling directories.
//!
//! A playback turns the file listing of a directory into send transactions. Only a bounded
//! number of its transactions are in flight at the same time, the remaining file names wait
//! inside the playback until a slot frees up.
use std::{collections::VecDeque, format, string::String, vec::Vec};

use smallvec::SmallVec;

use crate::{
    arena::Handle, cmd::PlaybackRequest, timer::Timer, CfdpClass, EntityId,
    NUM_TRANSACTIONS_PER_PLAYBACK,
};

/// Owner of a send transaction which was started by a playback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PlaybackRef {
    Commanded(u8),
    Poll(u8),
}

/// Everything needed to create one send transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxParams {
    pub class: CfdpClass,
    pub keep: bool,
    pub priority: u8,
    pub dest_eid: EntityId,
    pub src_filename: String,
    pub dst_filename: String,
}

fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

#[derive(Debug, Default)]
pub(crate) struct Playback {
    pub busy: bool,
    class: CfdpClass,
    keep: bool,
    priority: u8,
    dest_eid: EntityId,
    src_dir: String,
    dst_dir: String,
    pending: VecDeque<String>,
    in_flight: SmallVec<[Handle; NUM_TRANSACTIONS_PER_PLAYBACK]>,
}

impl Playback {
    pub fn start(&mut self, request: &PlaybackRequest, files: Vec<String>) {
        self.class = request.class;
        self.keep = request.keep;
        self.priority = request.priority;
        self.dest_eid = request.dest_eid;
        self.src_dir.clone_from(&request.src_dir);
        self.dst_dir.clone_from(&request.dst_dir);
        self.pending = files.into();
        self.busy = true;
        self.refresh_busy();
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < NUM_TRANSACTIONS_PER_PLAYBACK
    }

    /// Parameters of the next file to send.
    pub fn next_transfer(&mut self) -> Option<TxParams> {
        let name = self.pending.pop_front()?;
        Some(TxParams {
            class: self.class,
            keep: self.keep,
            priority: self.priority,
            dest_eid: self.dest_eid,
            src_filename: join(&self.src_dir, &name),
            dst_filename: join(&self.dst_dir, &name),
        })
    }

    pub fn attach(&mut self, handle: Handle) {
        self.in_flight.push(handle);
    }

    /// Called when one of the transactions of the playback finished.
    pub fn detach(&mut self, handle: Handle) {
        self.in_flight.retain(|member| *member != handle);
        self.refresh_busy();
    }

    pub fn refresh_busy(&mut self) {
        if self.pending.is_empty() && self.in_flight.is_empty() {
            self.busy = false;
        }
    }

    /// Drop the files which were not started yet.
    pub fn stop(&mut self) {
        self.pending.clear();
        self.refresh_busy();
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PollDir {
    pub pb: Playback,
    pub timer: Timer,
    pub timer_set: bool,
}

/// Playback addressed by a reference.
pub(crate) fn playback_slot<'a>(
    playbacks: &'a mut [Playback],
    polls: &'a mut [PollDir],
    pb_ref: PlaybackRef,
) -> Option<&'a mut Playback> {
    match pb_ref {
        PlaybackRef::Commanded(idx) => playbacks.get_mut(idx as usize),
        PlaybackRef::Poll(idx) => polls.get_mut(idx as usize).map(|poll| &mut poll.pb),
    }
}
