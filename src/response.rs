//! [C8] Response queue + the `Result` sum type spec.md §3 replaces the
//! source's virtual-dispatch result hierarchy with (see DESIGN.md /
//! "Polymorphic results"). Holds an in-flight `waiting_task_ids` set and a
//! buffer of arrived results; producers (the scheduler) drop results in and
//! notify, readers (`reader.rs`) scan for a matching id (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::chat_parser::{ChatMsg, Diff};
use crate::error::ApiError;
use crate::lora::AdapterInfo;
use crate::metrics::MetricsSnapshot;
use crate::sampler::TokenCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    None,
    Eos,
    Word,
    Limit,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

/// A completion result, partial (one per generated token when streaming) or
/// final. Same shape for both; `stop` is `None` for partials.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CmplResult {
    pub id_slot: i64,
    /// Token delta (partial) or accumulated text (final).
    pub content: String,
    pub tokens: Vec<i32>,
    pub stop: Option<StopType>,
    pub stopping_word: String,
    pub truncated: bool,
    pub n_decoded: usize,
    pub n_prompt_tokens: usize,
    pub n_prompt_tokens_cached: usize,
    pub has_new_line: bool,
    pub chat_diff: Option<Diff>,
    pub chat_msg: Option<ChatMsg>,
    pub probs: Vec<TokenCandidate>,
    pub timings: Timings,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EmbdResult {
    pub embedding: Vec<Vec<f32>>,
    pub n_tokens: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RerankResult {
    pub score: f32,
    pub n_tokens: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotSaveLoadResult {
    pub id_slot: i64,
    pub filename: String,
    pub n_tokens: usize,
    pub n_bytes: usize,
    pub t_ms: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotEraseResult {
    pub id_slot: i64,
    pub n_erased: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotInfo {
    pub id: i32,
    pub state: &'static str,
    pub n_ctx: usize,
    pub n_prompt_tokens: usize,
    pub is_processing: bool,
    /// Redacted unless `--slots` exposes prompts (spec.md §7 privacy note
    /// mirrored from `--slots` / `params_base.endpoint_slots`).
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ResultData {
    CmplPartial(CmplResult),
    CmplFinal(CmplResult),
    Embd(EmbdResult),
    Rerank(RerankResult),
    Error(ApiError),
    Metrics(Box<MetricsSnapshot>),
    SlotSaveLoad(SlotSaveLoadResult),
    SlotErase(SlotEraseResult),
    GetLora(Vec<AdapterInfo>),
    ApplyLora,
    SlotsInfo(Vec<SlotInfo>),
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: i64,
    pub index: usize,
    pub data: ResultData,
}

impl TaskResult {
    pub fn is_final(&self) -> bool {
        !matches!(self.data, ResultData::CmplPartial(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.data, ResultData::Error(_))
    }

    pub fn as_api_error(&self) -> Option<ApiError> {
        match &self.data {
            ResultData::Error(err) => Some(err.clone()),
            _ => None,
        }
    }
}

struct Inner {
    waiting_task_ids: HashSet<i64>,
    buffer: HashMap<i64, Vec<TaskResult>>,
}

/// [C8]. Single producer (the scheduler thread), many consumer readers.
pub struct ResponseQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl ResponseQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { waiting_task_ids: HashSet::new(), buffer: HashMap::new() }),
            cv: Condvar::new(),
        })
    }

    /// Register ids a reader is about to wait on (spec.md §4.7 `post_tasks`).
    pub fn add_waiting_ids(&self, ids: impl IntoIterator<Item = i64>) {
        let mut g = self.inner.lock().unwrap();
        for id in ids {
            g.waiting_task_ids.insert(id);
        }
    }

    /// Drop ids from the waiting set, purging any already-buffered results
    /// for them (spec.md §4.6: "any result whose id is not in
    /// `waiting_task_ids` is silently dropped").
    pub fn remove_waiting_ids(&self, ids: impl IntoIterator<Item = i64>) {
        let mut g = self.inner.lock().unwrap();
        for id in ids {
            g.waiting_task_ids.remove(&id);
            g.buffer.remove(&id);
        }
    }

    /// Producer side: the scheduler drops a result in. Silently dropped if
    /// nobody is waiting on its id (reader already cancelled).
    pub fn send(&self, result: TaskResult) {
        let mut g = self.inner.lock().unwrap();
        if !g.waiting_task_ids.contains(&result.id) {
            return;
        }
        g.buffer.entry(result.id).or_default().push(result);
        drop(g);
        self.cv.notify_all();
    }

    /// Block (up to `timeout`, or forever if `None`) until a result for one
    /// of `ids` is available, then pop and return the oldest one
    /// (spec.md §4.6 `recv`).
    pub fn recv(&self, ids: &HashSet<i64>, timeout: Option<Duration>) -> Option<TaskResult> {
        let mut g = self.inner.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(&id) = ids.iter().find(|id| g.buffer.get(id).is_some_and(|v| !v.is_empty())) {
                let vec = g.buffer.get_mut(&id).unwrap();
                return Some(vec.remove(0));
            }
            match deadline {
                None => g = self.cv.wait(g).unwrap(),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return None;
                    }
                    let (guard, res) = self.cv.wait_timeout(g, dl - now).unwrap();
                    g = guard;
                    if res.timed_out() {
                        continue;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(id: i64) -> TaskResult {
        TaskResult { id, index: 0, data: ResultData::CmplPartial(CmplResult::default()) }
    }

    #[test]
    fn send_without_a_waiter_is_dropped() {
        let q = ResponseQueue::new();
        q.send(partial(1));
        let ids = HashSet::from([1]);
        assert!(q.recv(&ids, Some(Duration::from_millis(10))).is_none());
    }

    #[test]
    fn send_then_recv_round_trips() {
        let q = ResponseQueue::new();
        q.add_waiting_ids([1]);
        q.send(partial(1));
        let ids = HashSet::from([1]);
        let got = q.recv(&ids, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(got.id, 1);
    }

    #[test]
    fn recv_preserves_arrival_order_per_id() {
        let q = ResponseQueue::new();
        q.add_waiting_ids([1]);
        q.send(TaskResult { id: 1, index: 0, data: ResultData::CmplPartial(CmplResult { content: "a".into(), ..Default::default() }) });
        q.send(TaskResult { id: 1, index: 0, data: ResultData::CmplPartial(CmplResult { content: "b".into(), ..Default::default() }) });
        let ids = HashSet::from([1]);
        let first = q.recv(&ids, Some(Duration::from_millis(10))).unwrap();
        let second = q.recv(&ids, Some(Duration::from_millis(10))).unwrap();
        match (first.data, second.data) {
            (ResultData::CmplPartial(a), ResultData::CmplPartial(b)) => {
                assert_eq!(a.content, "a");
                assert_eq!(b.content, "b");
            }
            _ => panic!("expected partials"),
        }
    }

    #[test]
    fn remove_waiting_ids_purges_buffered_results() {
        let q = ResponseQueue::new();
        q.add_waiting_ids([1]);
        q.send(partial(1));
        q.remove_waiting_ids([1]);
        let ids = HashSet::from([1]);
        assert!(q.recv(&ids, Some(Duration::from_millis(10))).is_none());
    }

    #[test]
    fn recv_times_out_with_no_result() {
        let q = ResponseQueue::new();
        q.add_waiting_ids([1]);
        let ids = HashSet::from([1]);
        assert!(q.recv(&ids, Some(Duration::from_millis(10))).is_none());
    }
}
