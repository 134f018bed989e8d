//! [C9] Response reader: binds one HTTP request to the set of task ids it
//! spawned and pumps the response queue on its behalf (spec.md §4.7).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::chat_parser::ParserState;
use crate::error::ApiError;
use crate::queue::TaskQueue;
use crate::response::{ResponseQueue, ResultData, TaskResult};
use crate::task::{ChatParserParams, Task, TaskType};

/// One request's view onto `compute_diffs`-ready parser state per child
/// index, so `next()` can advance a result's chat-parser state before
/// handing it back to the HTTP layer.
pub struct ResponseReader {
    queue: Arc<TaskQueue>,
    responses: Arc<ResponseQueue>,
    id_tasks: Vec<i64>,
    received_count: usize,
    parser_params: Vec<ChatParserParams>,
    parser_states: Vec<Option<ParserState>>,
    /// Full raw model-output text accumulated so far per child index.
    /// `CmplResult::content` on a streamed partial only carries that
    /// token's delta (spec.md §4.3 `process_token`); the chat parser needs
    /// the whole growing string to reparse against (spec.md §4.8), so the
    /// reader — not the scheduler — is where the two get stitched back
    /// together.
    raw_text: Vec<String>,
    polling_interval: Duration,
}

impl ResponseReader {
    pub fn new(queue: Arc<TaskQueue>, responses: Arc<ResponseQueue>, polling_interval: Duration) -> Self {
        Self {
            queue,
            responses,
            id_tasks: Vec::new(),
            received_count: 0,
            parser_params: Vec::new(),
            parser_states: Vec::new(),
            raw_text: Vec::new(),
            polling_interval,
        }
    }

    /// Assign indices 0..N across parent+children, register them as
    /// waiting, and push to the task queue (`front` for high-priority
    /// control endpoints like `/metrics`).
    ///
    /// Call sites build one `Task` per `n_cmpl` copy (spec.md §3 `n_cmpl`),
    /// and for batch endpoints (`/completion` with a prompt array,
    /// `/embeddings` with multiple inputs) one run of copies per distinct
    /// prompt. Each maximal run of consecutive tasks sharing an identical
    /// prompt is a fan-out family: its first task becomes the parent and
    /// the rest link to it via `id_parent` (spec.md §4.3 "child tasks index
    /// their parent by id") — the scheduler launches the parent normally
    /// and parks the rest in `WaitOther` until it reaches `DonePrompt`,
    /// then copies its KV into each child via `seq_cp` instead of
    /// re-running their prefill. Within a family, children are posted to
    /// the queue before the parent (spec.md §5 ordering) so a peek at
    /// `waiting_task_ids` always finds the whole family together.
    pub fn post_tasks(&mut self, mut tasks: Vec<Task>, front: bool) {
        for (index, task) in tasks.iter_mut().enumerate() {
            task.index = index;
        }
        for task in tasks.iter_mut() {
            if task.id < 0 {
                task.id = self.queue.next_id();
            }
        }

        let mut families: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        while start < tasks.len() {
            let mut end = start + 1;
            while end < tasks.len() && same_prompt(&tasks[start], &tasks[end]) {
                end += 1;
            }
            if end - start > 1 {
                let parent_id = tasks[start].id;
                for t in &mut tasks[start + 1..end] {
                    t.id_parent = parent_id;
                }
            }
            families.push((start, end));
            start = end;
        }

        self.parser_params = tasks.iter().map(|t| t.params.chat_parser_params.clone()).collect();
        self.parser_states = tasks.iter().map(|_| None).collect();
        self.raw_text = tasks.iter().map(|_| String::new()).collect();
        self.id_tasks = tasks.iter().map(|t| t.id).collect();
        self.responses.add_waiting_ids(self.id_tasks.iter().copied());

        let mut slots: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
        for (start, end) in families {
            for i in start + 1..end {
                self.queue.post(slots[i].take().expect("task queued twice"), front);
            }
            self.queue.post(slots[start].take().expect("task queued twice"), front);
        }
    }

    fn waiting_ids(&self) -> HashSet<i64> {
        self.id_tasks.iter().copied().collect()
    }

    /// Poll once, blocking up to `polling_interval`; re-checks
    /// `should_stop` on every timeout (client-disconnect detector). On an
    /// error result, cancels all remaining in-flight ids and returns the
    /// error. Returns `Ok(None)` once nothing remains to wait for.
    pub fn next(&mut self, should_stop: &dyn Fn() -> bool) -> Result<Option<TaskResult>, ApiError> {
        loop {
            if self.received_count >= self.id_tasks.len() {
                return Ok(None);
            }
            if should_stop() {
                self.stop();
                return Ok(None);
            }
            let ids = self.waiting_ids();
            match self.responses.recv(&ids, Some(self.polling_interval)) {
                None => continue,
                Some(mut result) => {
                    if result.is_error() {
                        let err = result.as_api_error().unwrap_or(ApiError::Server("unknown error".into()));
                        self.stop();
                        return Err(err);
                    }
                    let is_final = result.is_final();
                    if let ResultData::CmplPartial(ref mut cmpl) | ResultData::CmplFinal(ref mut cmpl) = result.data {
                        if let (Some(params), Some(slot), Some(raw)) = (
                            self.parser_params.get(result.index),
                            self.parser_states.get_mut(result.index),
                            self.raw_text.get_mut(result.index),
                        ) {
                            raw.push_str(&cmpl.content);
                            let state = slot.get_or_insert_with(|| {
                                ParserState::new(
                                    params.format,
                                    params.reasoning_format,
                                    params.reasoning_in_content,
                                    params.thinking_forced_open,
                                )
                            });
                            let diff = state.update(raw);
                            cmpl.chat_diff = Some(diff);
                            if is_final {
                                cmpl.chat_msg = Some(state.finalize());
                            }
                        }
                    }
                    if result.is_final() {
                        self.received_count += 1;
                    }
                    return Ok(Some(result));
                }
            }
        }
    }

    /// Aggregate every task's final result into an ordered vector sized
    /// `id_tasks.len()`. On error, stops remaining ids and returns the
    /// error; on disconnect, returns the results gathered so far.
    pub fn wait_for_all(&mut self, should_stop: &dyn Fn() -> bool) -> Result<Vec<TaskResult>, ApiError> {
        let mut finals: Vec<Option<TaskResult>> = vec![None; self.id_tasks.len()];
        loop {
            match self.next(should_stop) {
                Ok(None) => break,
                Ok(Some(result)) => {
                    if result.is_final() {
                        let idx = result.index;
                        if idx < finals.len() {
                            finals[idx] = Some(result);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(finals.into_iter().flatten().collect())
    }

    /// Enqueue front-priority `Cancel` tasks for every still-waiting id and
    /// drop them from the response queue's waiting set.
    pub fn stop(&mut self) {
        for &id in &self.id_tasks {
            let mut cancel = Task::control(TaskType::Cancel);
            cancel.id_target = id;
            self.queue.post(cancel, true);
        }
        self.responses.remove_waiting_ids(self.id_tasks.iter().copied());
    }
}

impl Drop for ResponseReader {
    fn drop(&mut self) {
        self.responses.remove_waiting_ids(self.id_tasks.iter().copied());
    }
}

/// Whether two tasks carry the same prompt, used to group `n_cmpl` copies
/// into one fan-out family without also grouping across the distinct
/// prompts of a batched request (spec.md §6 `/completion` prompt arrays,
/// `/embeddings` multi-input).
fn same_prompt(a: &Task, b: &Task) -> bool {
    a.tokens.len() == b.tokens.len() && a.tokens.common_prefix_len(&b.tokens) == a.tokens.len()
}
