//! Scripted upstream used by engine and refresher tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::SubmitOutcome;
use crate::error::{Error, Result};
use crate::types::{MinerRound, MiningInfo};

#[derive(Default)]
pub(crate) struct MockUpstream {
    infos: Mutex<VecDeque<MiningInfo>>,
    response: Mutex<Vec<u8>>,
    fail_submit: AtomicBool,
    fire_and_forget: AtomicBool,
    submitted: Mutex<Vec<MinerRound>>,
}

impl MockUpstream {
    pub fn with_response(body: &[u8]) -> Self {
        let mock = Self::default();
        mock.set_response(body);
        mock
    }

    pub fn set_response(&self, body: &[u8]) {
        *self.response.lock().unwrap() = body.to_vec();
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::Relaxed);
    }

    pub fn set_fire_and_forget(&self, fire: bool) {
        self.fire_and_forget.store(fire, Ordering::Relaxed);
    }

    /// Queue a mining info for the next fetch.
    pub fn push_info(&self, height: u64, base_target: u64) {
        self.infos
            .lock()
            .unwrap()
            .push_back(MiningInfo::new(height, base_target, 0, "ab".to_string()));
    }

    pub fn submitted(&self) -> Vec<MinerRound> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn fetch(&self) -> Result<Option<MiningInfo>> {
        Ok(self.infos.lock().unwrap().pop_front())
    }

    pub fn submit(&self, round: &MinerRound) -> Result<SubmitOutcome> {
        if self.fail_submit.load(Ordering::Relaxed) {
            return Err(Error::Upstream("mock transport down".to_string()));
        }
        self.submitted.lock().unwrap().push(round.clone());
        if self.fire_and_forget.load(Ordering::Relaxed) {
            Ok(SubmitOutcome::Fired)
        } else {
            Ok(SubmitOutcome::Body(self.response.lock().unwrap().clone()))
        }
    }
}
