//! [C10] Scheduler: the single-threaded cooperative loop that owns the
//! backend exclusively and drives every slot through its state machine
//! (spec.md §4.4). Runs on its own OS thread; the task queue and response
//! queue are the only cross-thread shared state (spec.md §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, Batch, DecodeOutcome, DraftBackend, SeqId};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::lora::{resolve_lora, AdapterInfo};
use crate::metrics::Metrics;
use crate::prompt_cache::PromptCache;
use crate::queue::TaskQueue;
use crate::response::{
    CmplResult, EmbdResult, RerankResult, ResponseQueue, ResultData, SlotEraseResult, SlotInfo, SlotSaveLoadResult,
    StopType, TaskResult,
};
use crate::sampler::Sampler;
use crate::slot::{Slot, SlotState};
use crate::task::{Task, TaskType};
use crate::token_buf::TokenBuf;

pub struct Scheduler {
    backend: Arc<dyn Backend>,
    draft_backend: Option<Arc<dyn DraftBackend>>,
    slots: Vec<Slot>,
    queue: Arc<TaskQueue>,
    responses: Arc<ResponseQueue>,
    prompt_cache: PromptCache,
    lora_available: Vec<AdapterInfo>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
    terminate: Arc<AtomicBool>,
    last_activity: Instant,
    sleeping: bool,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn Backend>,
        draft_backend: Option<Arc<dyn DraftBackend>>,
        queue: Arc<TaskQueue>,
        responses: Arc<ResponseQueue>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
        lora_available: Vec<AdapterInfo>,
    ) -> Self {
        let n_ctx_per_slot = config.ctx_size.max(1) as usize;
        let slots = (0..config.n_parallel as i32)
            .map(|id| Slot::new(id, n_ctx_per_slot, config.n_ctx_checkpoints))
            .collect();
        let cache_bytes = config.cache_ram_mib * 1024 * 1024;
        Self {
            backend,
            draft_backend,
            slots,
            queue,
            responses,
            prompt_cache: PromptCache::new(cache_bytes),
            lora_available,
            metrics,
            config,
            terminate: Arc::new(AtomicBool::new(false)),
            last_activity: Instant::now(),
            sleeping: false,
        }
    }

    pub fn terminate_handle(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Run until `terminate()` is called. This call never returns on its
    /// own; callers spawn it on a dedicated thread (spec.md §4.9
    /// `start_loop`).
    pub fn run(&mut self) {
        while !self.terminate.load(Ordering::Relaxed) {
            self.step();
        }
    }

    fn step(&mut self) {
        let tasks = self.queue.drain();
        if !tasks.is_empty() {
            self.last_activity = Instant::now();
        }
        for task in tasks {
            self.dispatch(task);
        }

        self.context_shift_pass();

        let batch = self.assemble_batch();
        if !batch.is_empty() {
            self.decode_batch(batch);
            self.post_decode();
            self.generate_drafts();
            self.checkpoint_pass();
        }

        self.metrics.on_decode_call(self.slots.iter().filter(|s| s.is_processing()).count());

        if self.queue.is_idle() && self.slots.iter().all(Slot::is_idle) {
            self.idle_tick();
        } else {
            self.queue.wait_for_activity();
        }
    }

    // ---- step 1: dispatch -------------------------------------------------

    fn dispatch(&mut self, task: Task) {
        if task.is_control() {
            self.dispatch_control(task);
        } else {
            self.assign(task);
        }
    }

    fn dispatch_control(&mut self, task: Task) {
        match task.kind {
            TaskType::Cancel => self.handle_cancel(task),
            TaskType::Metrics => {
                let snapshot = Box::new(self.metrics.snapshot());
                self.responses.send(TaskResult { id: task.id, index: task.index, data: ResultData::Metrics(snapshot) });
            }
            TaskType::SlotsInfo => {
                let infos = self
                    .slots
                    .iter()
                    .map(|s| SlotInfo {
                        id: s.id,
                        state: slot_state_name(s.state),
                        n_ctx: s.n_ctx,
                        n_prompt_tokens: s.prompt.tokens.len(),
                        is_processing: s.is_processing(),
                        prompt: if self.config.expose_slot_prompts {
                            let ids: Vec<i32> = s
                                .prompt
                                .tokens
                                .raw_tokens()
                                .iter()
                                .filter(|&&t| t != crate::token_buf::MEDIA)
                                .map(|&t| t as i32)
                                .collect();
                            self.backend.detokenize(&ids, false).ok()
                        } else {
                            None
                        },
                    })
                    .collect();
                self.responses.send(TaskResult { id: task.id, index: task.index, data: ResultData::SlotsInfo(infos) });
            }
            TaskType::SlotSave => self.handle_slot_save(task),
            TaskType::SlotRestore => self.handle_slot_restore(task),
            TaskType::SlotErase => self.handle_slot_erase(task),
            TaskType::GetLora => {
                self.responses.send(TaskResult {
                    id: task.id,
                    index: task.index,
                    data: ResultData::GetLora(self.lora_available.clone()),
                });
            }
            TaskType::SetLora => {
                // Per-request lora is resolved at launch time; SetLora only
                // updates the server-wide default adapter set.
                if let Some(requested) = &task.lora_set {
                    self.lora_available = requested
                        .iter()
                        .filter_map(|(id, scale)| {
                            self.lora_available.iter().find(|a| &a.id == id).map(|a| {
                                let mut a = a.clone();
                                a.scale = *scale;
                                a
                            })
                        })
                        .collect();
                }
                self.responses.send(TaskResult { id: task.id, index: task.index, data: ResultData::ApplyLora });
            }
            _ => {}
        }
    }

    fn handle_cancel(&mut self, task: Task) {
        if self.queue.remove_task(task.id_target) {
            self.fail_waiting_children(task.id_target, "parent task cancelled");
            return;
        }
        if let Some(idx) = self.slots.iter().position(|s| s.task.as_ref().is_some_and(|t| t.id == task.id_target)) {
            self.release_slot(idx);
            self.fail_waiting_children(task.id_target, "parent task cancelled");
        }
    }

    /// A fan-out parent that errors, gets cancelled, or is released before
    /// reaching `DonePrompt` leaves its children stranded in `WaitOther`
    /// forever unless they're explicitly failed too (spec.md §4.3 slot
    /// destruction; no separate "parent died" signal exists otherwise).
    fn fail_waiting_children(&mut self, parent_task_id: i64, message: &str) {
        let waiting: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::WaitOther && s.task.as_ref().is_some_and(|t| t.id_parent == parent_task_id))
            .map(|(i, _)| i)
            .collect();
        for i in waiting {
            if let Some(task) = &self.slots[i].task {
                self.error(task.id, task.index, message);
            }
            self.release_slot(i);
        }
    }

    fn handle_slot_save(&mut self, task: Task) {
        let Some(idx) = self.slots.iter().position(|s| s.id as i64 == task.id_slot) else {
            self.error(task.id, task.index, "unknown slot id");
            return;
        };
        if self.slots[idx].is_processing() {
            self.error(task.id, task.index, "slot is busy");
            return;
        }
        let Some(dir) = &self.config.slot_save_path else {
            self.error(task.id, task.index, "slot save/restore not configured");
            return;
        };
        let Some(filename) = &task.slot_save_filename else {
            self.error(task.id, task.index, "missing filename");
            return;
        };
        let t0 = Instant::now();
        let data = match self.backend.state_get(self.slots[idx].id) {
            Ok(d) => d,
            Err(e) => {
                self.error(task.id, task.index, &e.to_string());
                return;
            }
        };
        let blob = postcard::to_allocvec(&(self.slots[idx].prompt.tokens.raw_tokens().to_vec(), data.clone()))
            .unwrap_or_default();
        let path = dir.join(filename);
        if let Err(e) = std::fs::write(&path, &blob) {
            self.error(task.id, task.index, &format!("failed to write slot file: {e}"));
            return;
        }
        self.responses.send(TaskResult {
            id: task.id,
            index: task.index,
            data: ResultData::SlotSaveLoad(SlotSaveLoadResult {
                id_slot: task.id_slot,
                filename: filename.clone(),
                n_tokens: self.slots[idx].prompt.tokens.len(),
                n_bytes: blob.len(),
                t_ms: t0.elapsed().as_secs_f64() * 1000.0,
            }),
        });
    }

    fn handle_slot_restore(&mut self, task: Task) {
        let Some(idx) = self.slots.iter().position(|s| s.id as i64 == task.id_slot) else {
            self.error(task.id, task.index, "unknown slot id");
            return;
        };
        if self.slots[idx].is_processing() {
            self.error(task.id, task.index, "slot is busy");
            return;
        }
        let Some(dir) = &self.config.slot_save_path else {
            self.error(task.id, task.index, "slot save/restore not configured");
            return;
        };
        let Some(filename) = &task.slot_save_filename else {
            self.error(task.id, task.index, "missing filename");
            return;
        };
        let t0 = Instant::now();
        let path = dir.join(filename);
        let blob = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                self.error(task.id, task.index, &format!("failed to read slot file: {e}"));
                return;
            }
        };
        let (tokens, data): (Vec<i64>, Vec<u8>) = match postcard::from_bytes(&blob) {
            Ok(v) => v,
            Err(e) => {
                self.error(task.id, task.index, &format!("corrupt slot file: {e}"));
                return;
            }
        };
        if let Err(e) = self.backend.state_set(self.slots[idx].id, &data) {
            self.error(task.id, task.index, &e.to_string());
            return;
        }
        let mut buf = TokenBuf::new(false);
        for t in &tokens {
            buf.push_text(*t);
        }
        let n_tokens = buf.len();
        self.slots[idx].prompt.tokens = buf;
        self.responses.send(TaskResult {
            id: task.id,
            index: task.index,
            data: ResultData::SlotSaveLoad(SlotSaveLoadResult {
                id_slot: task.id_slot,
                filename: filename.clone(),
                n_tokens,
                n_bytes: blob.len(),
                t_ms: t0.elapsed().as_secs_f64() * 1000.0,
            }),
        });
    }

    fn handle_slot_erase(&mut self, task: Task) {
        let Some(idx) = self.slots.iter().position(|s| s.id as i64 == task.id_slot) else {
            self.error(task.id, task.index, "unknown slot id");
            return;
        };
        if self.slots[idx].is_processing() {
            self.error(task.id, task.index, "slot is busy");
            return;
        }
        let n_erased = self.slots[idx].prompt.tokens.len();
        self.backend.seq_rm(self.slots[idx].id, 0, -1);
        self.slots[idx].prompt.tokens.clear();
        self.slots[idx].prompt.checkpoints.clear();
        self.responses.send(TaskResult {
            id: task.id,
            index: task.index,
            data: ResultData::SlotErase(SlotEraseResult { id_slot: task.id_slot, n_erased }),
        });
    }

    fn error(&self, id: i64, index: usize, message: &str) {
        self.error_typed(id, index, crate::error::ApiError::Server(message.to_string()));
    }

    fn error_typed(&self, id: i64, index: usize, err: crate::error::ApiError) {
        self.responses.send(TaskResult { id, index, data: ResultData::Error(err) });
    }

    // ---- step 2: assign ----------------------------------------------------

    fn assign(&mut self, mut task: Task) {
        if task.kind == TaskType::Embedding && !self.config.embeddings {
            self.error(task.id, task.index, "embeddings endpoint disabled, start with --embeddings");
            return;
        }
        if task.kind == TaskType::Rerank && !self.config.reranking {
            self.error(task.id, task.index, "rerank endpoint disabled, start with --reranking");
            return;
        }
        let n_ctx_per_slot = self.slots.first().map_or(usize::MAX, |s| s.n_ctx);
        if task.tokens.len() >= n_ctx_per_slot {
            self.error_typed(
                task.id,
                task.index,
                crate::error::ApiError::ExceedContextSize { n_prompt_tokens: task.tokens.len(), n_ctx: n_ctx_per_slot },
            );
            return;
        }

        let idx = match self.select_slot(&task) {
            Some(idx) => idx,
            None => {
                if self.config.fail_on_no_slot {
                    self.error(task.id, task.index, "no slot available");
                } else {
                    self.queue.defer(task);
                }
                return;
            }
        };

        // A fan-out child (spec.md §3 `id_parent`, n_cmpl > 1) waits in
        // `WaitOther` for its parent to reach `DonePrompt`: it never runs its
        // own prompt-cache lookup or prefill, it inherits the parent's KV via
        // `seq_cp` instead (spec.md §4.4 step 2/7).
        let is_child = task.id_parent >= 0;

        if !is_child && self.should_update_cache(idx, &task) {
            self.save_to_cache(idx);
            self.load_from_cache(idx, &task);
        }

        let sampler = match Sampler::new(task.params.sampling.clone()) {
            Ok(s) => s,
            Err(e) => {
                self.error(task.id, task.index, &format!("sampler init failed: {e}"));
                return;
            }
        };
        let (lora, alora_start) = match resolve_lora(&self.lora_available, &task.params.lora, &task.tokens) {
            Ok(v) => v,
            Err(e) => {
                self.error(task.id, task.index, &e);
                return;
            }
        };

        task.id_slot = self.slots[idx].id as i64;
        self.slots[idx].launch(task, sampler, lora, alora_start, is_child);
    }

    fn select_slot(&self, task: &Task) -> Option<usize> {
        if task.id_slot >= 0 {
            return self
                .slots
                .iter()
                .position(|s| s.id as i64 == task.id_slot && s.is_idle());
        }

        let similarity = self.config.slot_prompt_similarity;
        let mut best: Option<(usize, f64)> = None;
        for (i, s) in self.slots.iter().enumerate() {
            if !s.is_idle() {
                continue;
            }
            if s.prompt.tokens.is_empty() || task.tokens.is_empty() {
                continue;
            }
            let lcp = s.prompt.tokens.common_prefix_len(&task.tokens) as f64;
            let sim = lcp / task.tokens.len() as f64;
            if sim >= similarity as f64 && best.is_none_or(|(_, bs)| sim > bs) {
                best = Some((i, sim));
            }
        }
        if let Some((i, _)) = best {
            return Some(i);
        }

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_idle())
            .min_by_key(|(_, s)| s.t_last_used)
            .map(|(i, _)| i)
    }

    /// Whether the chosen slot's existing cached prompt should be swapped to
    /// the prompt cache before the new task overwrites it: when the LCP
    /// match would discard more than half the slot's cached context, or the
    /// slot was picked by plain LRU (no similarity at all).
    fn should_update_cache(&self, idx: usize, task: &Task) -> bool {
        if !task.params.cache_prompt || self.prompt_cache.is_disabled() {
            return false;
        }
        let slot = &self.slots[idx];
        if slot.prompt.tokens.is_empty() {
            return false;
        }
        let lcp = slot.prompt.tokens.common_prefix_len(&task.tokens);
        lcp * 2 < slot.prompt.tokens.len()
    }

    fn save_to_cache(&mut self, idx: usize) {
        let slot = &self.slots[idx];
        if slot.prompt.tokens.is_empty() {
            return;
        }
        let Ok(data) = self.backend.state_get(slot.id) else { return };
        if let Some(cache_idx) = self.prompt_cache.alloc(&slot.prompt.tokens, data.len()) {
            self.prompt_cache.fill(cache_idx, data, Vec::new());
            self.prompt_cache.update();
        }
    }

    fn load_from_cache(&mut self, idx: usize, task: &Task) {
        let slot_id = self.slots[idx].id;
        let baseline = self.slots[idx].prompt.tokens.clone();
        if let Some((tokens, checkpoints)) = self.prompt_cache.load(self.backend.as_ref(), slot_id, &task.tokens, &baseline) {
            self.slots[idx].prompt.tokens = tokens;
            self.slots[idx].prompt.checkpoints.clear();
            for cp in checkpoints {
                self.slots[idx].prompt.checkpoints.push(cp);
            }
        }
    }

    fn release_slot(&mut self, idx: usize) {
        let id_slot = self.slots[idx].id;
        // spec.md §3 Slot "Destruction": a child slot's KV cells are
        // private copies from `seq_cp` and must be purged on release; a
        // non-child slot's KV is its reusable cached prompt and is left in
        // place for the next LCP match.
        if self.slots[idx].is_child {
            self.backend.seq_rm(id_slot, 0, -1);
            self.slots[idx].prompt.tokens.clear();
            self.slots[idx].prompt.checkpoints.clear();
        }
        self.slots[idx].release();
        self.queue.pop_deferred_task(id_slot as i64);
    }

    // ---- step 3: context shift ---------------------------------------------

    fn context_shift_pass(&mut self) {
        if !self.config.ctx_shift {
            return;
        }
        for slot in self.slots.iter_mut().filter(|s| s.is_generating()) {
            if slot.prompt.tokens.len() + 1 < slot.n_ctx {
                continue;
            }
            if slot.prompt.tokens.has_mtmd() {
                continue;
            }
            let Some(task) = &slot.task else { continue };
            let bos_extra = if 0 < slot.prompt.tokens.len() { 1 } else { 0 };
            let n_keep = (task.params.n_keep.max(0) as usize + bos_extra).min(slot.n_ctx.saturating_sub(4));
            let n_discard = if task.params.n_discard > 0 {
                task.params.n_discard as usize
            } else {
                (slot.n_ctx - n_keep) / 2
            };
            self.backend.seq_rm(slot.id, n_keep as i32, (n_keep + n_discard) as i32);
            self.backend.seq_add(slot.id, (n_keep + n_discard) as i32, -1, -(n_discard as i32));
            let remaining: Vec<i64> = {
                let raw = slot.prompt.tokens.raw_tokens();
                raw[..n_keep].iter().chain(raw[n_keep + n_discard..].iter()).copied().collect()
            };
            let mut shifted = TokenBuf::new(slot.prompt.tokens.has_mtmd());
            for t in remaining {
                shifted.push_text(t);
            }
            slot.prompt.tokens = shifted;
            slot.truncated = true;
        }
    }

    // ---- step 4/5: batch assembly + LCP reuse -----------------------------

    fn assemble_batch(&mut self) -> Batch {
        let mut batch = Batch::new();
        let n_batch = self.config.batch_size as usize;

        for slot in self.slots.iter_mut().filter(|s| s.is_generating()) {
            let base_pos = slot.prompt.tokens.pos_next() as i32;
            batch.push(slot.sampled.max(0), base_pos, slot.id, true);
            slot.i_batch = Some(batch.len() - 1);
            slot.i_batch_dft.clear();
            for (k, &d) in slot.drafted.iter().enumerate() {
                if batch.len() >= n_batch {
                    break;
                }
                batch.push(d, base_pos + 1 + k as i32, slot.id, true);
                slot.i_batch_dft.push(batch.len() - 1);
            }
        }

        for i in 0..self.slots.len() {
            if batch.len() >= n_batch {
                break;
            }
            if !matches!(self.slots[i].state, SlotState::Started | SlotState::ProcessingPrompt) {
                continue;
            }
            self.enqueue_prompt_tokens(i, &mut batch, n_batch);
        }

        batch
    }

    fn enqueue_prompt_tokens(&mut self, idx: usize, batch: &mut Batch, n_batch: usize) {
        let (seq_id, n_ctx) = (self.slots[idx].id, self.slots[idx].n_ctx);
        if self.slots[idx].state == SlotState::Started {
            self.begin_prompt_processing(idx);
        }

        loop {
            if batch.len() >= n_batch {
                return;
            }
            let n_past = self.slots[idx].prompt.tokens.len();
            let total = self.slots[idx].task.as_ref().map_or(0, |t| t.tokens.len());
            if n_past >= total {
                if let Some(last) = batch.entries.last_mut() {
                    if self.slots[idx].i_batch.is_none() {
                        last.logits = true;
                        self.slots[idx].i_batch = Some(batch.len() - 1);
                    }
                }
                self.slots[idx].state = SlotState::DonePrompt;
                return;
            }
            if n_past + 1 >= n_ctx {
                let n_prompt_tokens = self.slots[idx].task.as_ref().map_or(0, |t| t.tokens.len());
                let task_id = self.slots[idx].task.as_ref().map(|t| t.id);
                if let Some(task) = &self.slots[idx].task {
                    self.error_typed(
                        task.id,
                        task.index,
                        crate::error::ApiError::ExceedContextSize { n_prompt_tokens, n_ctx },
                    );
                }
                self.backend.seq_rm(self.slots[idx].id, 0, -1);
                self.slots[idx].prompt.tokens.clear();
                self.release_slot(idx);
                if let Some(task_id) = task_id {
                    self.fail_waiting_children(task_id, "context size exceeded");
                }
                return;
            }

            let task_tokens = self.slots[idx].task.as_ref().unwrap().tokens.clone();
            if task_tokens.is_media_at(n_past) {
                let Some((start, chunk)) = task_tokens.media_chunk_at(n_past) else { return };
                let chunk = chunk.clone();
                let pos = self.slots[idx].prompt.tokens.pos_next();
                let result = futures::executor::block_on(chunk.process(self.backend.as_ref(), pos, seq_id));
                if let Err(e) = result {
                    self.error_and_release(idx, &e.to_string());
                    return;
                }
                let mut extended = self.slots[idx].prompt.tokens.clone();
                let mut tail = TokenBuf::new(true);
                tail.push_media(chunk);
                let _ = start;
                extended.push_buf(&tail);
                self.slots[idx].prompt.tokens = extended;
                continue;
            }

            let tok = task_tokens.text_token_at(n_past);
            let pos = self.slots[idx].prompt.tokens.pos_next();
            let is_last = n_past + 1 == total;
            batch.push(tok as i32, pos as i32, seq_id, is_last);
            if is_last {
                self.slots[idx].i_batch = Some(batch.len() - 1);
            }
            self.slots[idx].prompt.tokens.push_text(tok);
            self.slots[idx].n_prompt_tokens_processed += 1;
            if batch.len() >= n_batch {
                return;
            }
        }
    }

    /// `Started -> ProcessingPrompt`: compute the longest-common-prefix reuse
    /// point against the slot's own cached prompt, honoring aLoRA's
    /// invocation-start clamp and the "never zero-evaluate a fully cached
    /// prompt" invariant (spec.md §4.4 step 5).
    fn begin_prompt_processing(&mut self, idx: usize) {
        let backend = self.backend.clone();
        let slot = &mut self.slots[idx];
        let task_tokens = slot.task.as_ref().unwrap().tokens.clone();
        let mut n_past = slot.prompt.tokens.common_prefix_len(&task_tokens);
        if let Some(alora_start) = slot.alora_invocation_start {
            if alora_start > 0 {
                n_past = n_past.min(alora_start - 1);
            }
        }

        let n_cache_reuse = slot.task.as_ref().map_or(0, |t| t.params.n_cache_reuse);
        let can_cache_reuse = backend.memory_can_shift() && !slot.prompt.tokens.has_mtmd() && !task_tokens.has_mtmd();
        if can_cache_reuse && n_cache_reuse > 0 {
            n_past = Self::reuse_cached_chunks(&mut slot.prompt.tokens, &task_tokens, slot.id, n_past, n_cache_reuse as usize, backend.as_ref());
        }

        if n_past == task_tokens.len() && n_past > 0 {
            n_past -= 1;
        }

        if backend.memory_uses_swa_or_recurrent() {
            let n_swa = backend.memory_swa_window();
            if n_swa > 0 && (n_past as i32) > n_swa {
                let threshold = n_past as i32 - n_swa;
                let restore = slot.prompt.checkpoints.find_for_recovery(n_past as i32, threshold).map(|cp| cp.data.clone());
                match restore {
                    Some(data) => {
                        let _ = backend.state_set_partial(slot.id, &data);
                    }
                    None => n_past = 0,
                }
            }
        }

        slot.prompt.tokens.truncate_to(n_past);
        slot.n_prompt_tokens_cache = n_past;
        slot.t_start_process_prompt = Some(Instant::now());
        slot.state = SlotState::ProcessingPrompt;

        if let Some(sampler) = &mut slot.sampler {
            sampler.reset();
            sampler.with_tokens(task_tokens.raw_tokens()[..n_past].iter().map(|&t| t as i32));
        }
        let lora = slot.lora.iter().map(|a| (a.id.clone(), a.scale)).collect::<Vec<_>>();
        backend.set_adapter_lora(slot.id, &lora);
    }

    /// Scan past `n_past` for windows of `>= n_cache_reuse` equal tokens
    /// between the slot's existing cached prompt and the new task tokens,
    /// shifting their KV cells into the new positions instead of
    /// recomputing them (spec.md §4.4 step 5, `server-context.cpp`'s
    /// cache-reuse loop). Returns the extended `n_past`.
    fn reuse_cached_chunks(cached: &mut TokenBuf, task_tokens: &TokenBuf, seq_id: SeqId, n_past: usize, n_cache_reuse: usize, backend: &dyn Backend) -> usize {
        let mut n_past = n_past;
        let mut head_c = n_past; // position within the cached prompt
        let mut head_p = n_past; // position within the new prompt
        let cached_len = cached.len();
        let new_len = task_tokens.len();

        while head_c < cached_len && head_p < new_len {
            let mut n_match = 0usize;
            while head_c + n_match < cached_len
                && head_p + n_match < new_len
                && cached.text_token_at(head_c + n_match) == task_tokens.text_token_at(head_p + n_match)
            {
                n_match += 1;
            }

            if n_match >= n_cache_reuse {
                let kv_shift = head_p as i64 - head_c as i64;
                backend.seq_rm(seq_id, head_p as i32, head_c as i32);
                backend.seq_add(seq_id, head_c as i32, (head_c + n_match) as i32, kv_shift as i32);
                for i in 0..n_match {
                    let id = cached.text_token_at(head_c + i);
                    cached.set_token_at(head_p + i, id);
                    n_past += 1;
                }
                head_c += n_match;
                head_p += n_match;
            } else {
                head_c += 1;
            }
        }
        n_past
    }

    fn error_and_release(&mut self, idx: usize, message: &str) {
        let task_id = self.slots[idx].task.as_ref().map(|t| t.id);
        if let Some(task) = &self.slots[idx].task {
            self.error(task.id, task.index, message);
        }
        self.backend.seq_rm(self.slots[idx].id, 0, -1);
        self.slots[idx].prompt.tokens.clear();
        self.release_slot(idx);
        if let Some(task_id) = task_id {
            self.fail_waiting_children(task_id, message);
        }
    }

    // ---- step 6: decode -----------------------------------------------------

    fn decode_batch(&mut self, batch: Batch) {
        let n_batch = self.config.batch_size as usize;
        let mut offset = 0;
        while offset < batch.entries.len() {
            let end = (offset + n_batch).min(batch.entries.len());
            let view = Batch { entries: batch.entries[offset..end].to_vec() };
            match futures::executor::block_on(self.backend.decode(&view)) {
                Ok(DecodeOutcome::Ok) => offset = end,
                Ok(DecodeOutcome::NoKvSlot) => {
                    self.release_all_active("context size exceeded");
                    return;
                }
                Ok(DecodeOutcome::InvalidBatch) => {
                    self.release_all_active("invalid decode batch");
                    return;
                }
                Ok(DecodeOutcome::ComputeError) => {
                    self.release_all_active("backend compute error");
                    return;
                }
                Err(e) => {
                    if self.try_clear_idle_slots() {
                        continue;
                    }
                    self.release_all_active(&e.to_string());
                    return;
                }
            }
        }
    }

    fn try_clear_idle_slots(&mut self) -> bool {
        if let Some(idx) = self.slots.iter().position(Slot::is_idle) {
            self.backend.seq_rm(self.slots[idx].id, 0, -1);
            self.slots[idx].prompt.tokens.clear();
            return true;
        }
        false
    }

    fn release_all_active(&mut self, message: &str) {
        for i in 0..self.slots.len() {
            if self.slots[i].is_processing() {
                self.error_and_release(i, message);
            }
        }
    }

    // ---- step 7: post-decode -------------------------------------------------

    fn post_decode(&mut self) {
        for i in 0..self.slots.len() {
            match self.slots[i].state {
                SlotState::DonePrompt => self.post_decode_done_prompt(i),
                SlotState::Generating => self.post_decode_generating(i),
                _ => {}
            }
        }
    }

    fn post_decode_done_prompt(&mut self, idx: usize) {
        let kind = self.slots[idx].task.as_ref().map(|t| t.kind);
        match kind {
            Some(TaskType::Embedding) => {
                let id = self.slots[idx].id;
                let n_tokens = self.slots[idx].prompt.tokens.len();
                match self.backend.embed(id, 0) {
                    Ok(v) => {
                        let (tid, tindex) = { let t = self.slots[idx].task.as_ref().unwrap(); (t.id, t.index) };
                        self.responses.send(TaskResult {
                            id: tid,
                            index: tindex,
                            data: ResultData::Embd(EmbdResult { embedding: vec![v], n_tokens }),
                        });
                        self.release_slot(idx);
                    }
                    Err(e) => self.error_and_release(idx, &e.to_string()),
                }
            }
            Some(TaskType::Rerank) => {
                let id = self.slots[idx].id;
                let n_tokens = self.slots[idx].prompt.tokens.len();
                match self.backend.embed(id, 1) {
                    Ok(v) => {
                        let (tid, tindex) = { let t = self.slots[idx].task.as_ref().unwrap(); (t.id, t.index) };
                        self.responses.send(TaskResult {
                            id: tid,
                            index: tindex,
                            data: ResultData::Rerank(RerankResult { score: v.first().copied().unwrap_or(0.0), n_tokens }),
                        });
                        self.release_slot(idx);
                    }
                    Err(e) => self.error_and_release(idx, &e.to_string()),
                }
            }
            _ => {
                let task_id = self.slots[idx].task.as_ref().map(|t| t.id);
                self.slots[idx].state = SlotState::Generating;
                self.slots[idx].t_start_generation = Some(Instant::now());
                self.checkpoint_if_due(idx);
                // Fan-out children waiting on this task inherit its KV and
                // i_batch now, before this slot samples its own first token
                // (sampling may release the slot on a 1-token budget, which
                // would otherwise clobber the state they need to copy).
                if let Some(task_id) = task_id {
                    self.promote_waiting_children(task_id, idx);
                }
                // spec.md §4.3 "DonePrompt -> Generating: first sampled
                // token accepted" — the logits row produced while enqueuing
                // the last prompt token (`i_batch`, still valid from this
                // same step) hasn't been sampled yet; do it now instead of
                // waiting for the next scheduler step to (wrongly) feed a
                // placeholder token back in.
                self.post_decode_generating(idx);
            }
        }
    }

    /// Copy a parent slot's freshly-completed KV and decode position into
    /// every still-`WaitOther` child of `parent_task_id` (spec.md §4.4 step
    /// 7). Children get their own fresh sampler (already built at launch)
    /// primed over the shared prefix, then join the next `DonePrompt`/
    /// `Generating` pass like any other slot.
    fn promote_waiting_children(&mut self, parent_task_id: i64, parent_idx: usize) {
        let parent_slot_id = self.slots[parent_idx].id;
        let parent_tokens = self.slots[parent_idx].prompt.tokens.clone();
        let parent_i_batch = self.slots[parent_idx].i_batch;
        let parent_n_prompt_processed = self.slots[parent_idx].n_prompt_tokens_processed;
        let parent_t_start = self.slots[parent_idx].t_start_process_prompt;

        let children: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != parent_idx && s.state == SlotState::WaitOther && s.task.as_ref().is_some_and(|t| t.id_parent == parent_task_id))
            .map(|(i, _)| i)
            .collect();

        for i in children {
            self.backend.seq_cp(parent_slot_id, self.slots[i].id, 0, -1);
            self.slots[i].prompt.tokens = parent_tokens.clone();
            self.slots[i].prompt.checkpoints.clear();
            self.slots[i].n_prompt_tokens_cache = 0;
            self.slots[i].n_prompt_tokens_processed = parent_n_prompt_processed;
            self.slots[i].t_start_process_prompt = parent_t_start;
            self.slots[i].i_batch = parent_i_batch;
            self.slots[i].state = SlotState::DonePrompt;
            if let Some(sampler) = &mut self.slots[i].sampler {
                sampler.reset();
                let ids: Vec<i32> = parent_tokens
                    .raw_tokens()
                    .iter()
                    .filter(|&&t| t != crate::token_buf::MEDIA)
                    .map(|&t| t as i32)
                    .collect();
                sampler.with_tokens(ids.into_iter());
            }
        }
    }

    fn post_decode_generating(&mut self, idx: usize) {
        let Some(i_batch) = self.slots[idx].i_batch else { return };
        if !self.slots[idx].i_batch_dft.is_empty() {
            self.speculative_accept(idx);
            return;
        }

        let id = self.slots[idx].id;
        let sampled = {
            let slot = &mut self.slots[idx];
            let sampler = slot.sampler.as_mut().unwrap();
            self.backend.sample(id, i_batch, sampler)
        };
        let token = match sampled {
            Ok(t) => t,
            Err(e) => {
                self.error_and_release(idx, &e.to_string());
                return;
            }
        };
        self.accept_token(idx, token);
    }

    fn accept_token(&mut self, idx: usize, token: i32) {
        self.slots[idx].sampler.as_mut().unwrap().accept(token);
        let piece = self
            .backend
            .token_to_piece(token, false)
            .ok()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        let is_eog = self.backend.is_eog(token);
        self.slots[idx].sampled = token;
        self.slots[idx].prompt.tokens.push_text(token as i64);

        let t0 = Instant::now();
        let delta = self.slots[idx].process_token(&piece, token, is_eog);
        self.metrics.on_token_predicted(t0.elapsed().as_micros() as u64);
        if let Some(sampler) = &mut self.slots[idx].sampler {
            sampler.maybe_arm_grammar(&self.slots[idx].generated_text);
        }

        let has_budget = self.slots[idx].has_budget(-1);
        if !has_budget && self.slots[idx].stop.is_none() {
            self.slots[idx].stop = Some(StopType::Limit);
            self.slots[idx].has_next_token = false;
        }

        let stop = self.slots[idx].stop;
        let task = self.slots[idx].task.as_ref().unwrap();
        let stream = task.params.stream;
        let id = task.id;
        let index = task.index;

        if stream && !delta.is_empty() {
            let result = self.build_cmpl_result(idx, delta, false);
            self.responses.send(TaskResult { id, index, data: ResultData::CmplPartial(result) });
        }

        if stop.is_some() || !self.slots[idx].has_next_token {
            let content = if stream { String::new() } else { self.slots[idx].generated_text.clone() };
            let result = self.build_cmpl_result(idx, content, true);
            self.responses.send(TaskResult { id, index, data: ResultData::CmplFinal(result) });
            self.release_slot(idx);
        }
    }

    fn build_cmpl_result(&self, idx: usize, content: String, is_final: bool) -> CmplResult {
        let slot = &self.slots[idx];
        let probs = if is_final || slot.task.as_ref().is_some_and(|t| t.params.sampling.n_probs > 0) {
            slot.probs.clone()
        } else {
            Vec::new()
        };
        CmplResult {
            id_slot: slot.id as i64,
            content,
            tokens: if slot.task.as_ref().is_some_and(|t| t.params.return_tokens) { slot.generated_tokens.clone() } else { Vec::new() },
            stop: if is_final { Some(slot.stop.unwrap_or(StopType::None)) } else { None },
            stopping_word: slot.stopping_word.clone(),
            truncated: slot.truncated,
            n_decoded: slot.n_decoded,
            n_prompt_tokens: slot.task.as_ref().map_or(0, |t| t.tokens.len()),
            n_prompt_tokens_cached: slot.n_prompt_tokens_cache,
            has_new_line: slot.has_new_line,
            chat_diff: None,
            chat_msg: None,
            probs,
            timings: slot.timings(),
        }
    }

    // ---- step 8: speculative decoding ---------------------------------------

    fn generate_drafts(&mut self) {
        let Some(draft) = self.draft_backend.clone() else { return };
        for i in 0..self.slots.len() {
            if self.slots[i].state != SlotState::Generating || !self.slots[i].i_batch_dft.is_empty() {
                continue;
            }
            let Some(task) = &self.slots[i].task else { continue };
            let spec = task.params.speculative.clone();
            if spec.n_max == 0 || self.slots[i].prompt.tokens.has_mtmd() {
                continue;
            }
            let n_draft_max = spec
                .n_max
                .min(self.slots[i].n_ctx.saturating_sub(self.slots[i].prompt.tokens.len() + 2))
                .min((self.slots[i].n_remaining.max(1) as usize).saturating_sub(1));
            if n_draft_max < spec.n_min {
                continue;
            }
            let context_tokens: Vec<i32> = self.slots[i].prompt.tokens.raw_tokens().iter().map(|&t| t as i32).collect();
            let seq_id = self.slots[i].id;
            let proposal = futures::executor::block_on(draft.propose(seq_id, &context_tokens, n_draft_max));
            match proposal {
                Ok(tokens) if tokens.len() >= spec.n_min => {
                    self.slots[i].drafted = tokens;
                }
                _ => self.slots[i].drafted.clear(),
            }
        }
    }

    fn speculative_accept(&mut self, idx: usize) {
        let drafted = std::mem::take(&mut self.slots[idx].drafted);
        let i_batch_dft = std::mem::take(&mut self.slots[idx].i_batch_dft);
        let id = self.slots[idx].id;

        let mut accepted = Vec::new();
        for &logits_idx in &i_batch_dft {
            let sampled = {
                let sampler = self.slots[idx].sampler.as_mut().unwrap();
                self.backend.sample(id, logits_idx, sampler)
            };
            let Ok(token) = sampled else { break };
            let expected = drafted.get(accepted.len()).copied();
            accepted.push(token);
            if expected != Some(token) {
                break;
            }
        }
        self.slots[idx].n_draft_total += drafted.len() as u64;
        self.slots[idx].n_draft_accepted += accepted.len().saturating_sub(1) as u64;

        for &token in &accepted {
            self.accept_token(idx, token);
            if !self.slots[idx].is_generating() {
                return;
            }
        }
    }

    // ---- step 9: checkpointing ----------------------------------------------

    fn checkpoint_pass(&mut self) {
        for i in 0..self.slots.len() {
            if self.slots[i].state == SlotState::Generating {
                self.checkpoint_if_due(i);
            }
        }
    }

    fn checkpoint_if_due(&mut self, idx: usize) {
        if !self.backend.memory_uses_swa_or_recurrent() {
            return;
        }
        let n_ctx_checkpoints = self.config.n_ctx_checkpoints;
        if n_ctx_checkpoints == 0 {
            return;
        }
        let id = self.slots[idx].id;
        let Some(pos_max) = self.backend.memory_pos_max(id) else { return };
        let pos_min = self.backend.memory_pos_min(id).unwrap_or(0);
        if !self.slots[idx].prompt.checkpoints.should_snapshot(pos_max, 64) {
            return;
        }
        if let Ok(data) = self.backend.state_get_partial(id, pos_min, pos_max) {
            self.slots[idx].prompt.checkpoints.push(Checkpoint { pos_min, pos_max, data });
        }
    }

    // ---- step 11: idle / sleep ----------------------------------------------

    fn idle_tick(&mut self) {
        if self.config.idle_sleep_ms == 0 {
            self.queue.wait_for_activity();
            return;
        }
        if self.sleeping {
            self.queue.wait_for_activity();
            return;
        }
        if self.last_activity.elapsed() >= Duration::from_millis(self.config.idle_sleep_ms) {
            tracing::info!("scheduler: entering sleep state");
            self.sleeping = true;
        }
        self.queue.wait_for_activity();
    }

    /// Called by the facade when any HTTP handler needs the backend awake
    /// (spec.md §5 "Sleeping": `wait_until_no_sleep()`).
    pub fn wake(&mut self) {
        if self.sleeping {
            tracing::info!("scheduler: waking from sleep state");
            self.sleeping = false;
            self.last_activity = Instant::now();
        }
    }
}

fn slot_state_name(state: SlotState) -> &'static str {
    match state {
        SlotState::Idle => "idle",
        SlotState::Started => "started",
        SlotState::WaitOther => "wait_other",
        SlotState::ProcessingPrompt => "processing_prompt",
        SlotState::DonePrompt => "done_prompt",
        SlotState::Generating => "generating",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backend::{BackendError, PoolingType, VocabMeta};
    use crate::media::MediaKind;

    /// Records `seq_rm`/`seq_add` calls; every other `Backend` method is
    /// unreachable from `reuse_cached_chunks` and panics if hit.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Backend for RecordingBackend {
        fn n_ctx_train(&self) -> usize {
            unimplemented!()
        }
        fn vocab(&self) -> &VocabMeta {
            unimplemented!()
        }
        fn pooling_type(&self) -> PoolingType {
            unimplemented!()
        }
        fn tokenize(&self, _: &str, _: bool, _: bool) -> Result<Vec<i32>, BackendError> {
            unimplemented!()
        }
        fn detokenize(&self, _: &[i32], _: bool) -> Result<String, BackendError> {
            unimplemented!()
        }
        fn token_to_piece(&self, _: i32, _: bool) -> Result<Vec<u8>, BackendError> {
            unimplemented!()
        }
        fn is_eog(&self, _: i32) -> bool {
            unimplemented!()
        }
        async fn decode(&self, _: &Batch) -> Result<DecodeOutcome, BackendError> {
            unimplemented!()
        }
        fn sample(&self, _: SeqId, _: usize, _: &mut Sampler) -> Result<i32, BackendError> {
            unimplemented!()
        }
        fn embed(&self, _: SeqId, _: usize) -> Result<Vec<f32>, BackendError> {
            unimplemented!()
        }
        fn seq_rm(&self, seq_id: SeqId, p0: i32, p1: i32) {
            self.calls.lock().unwrap().push(format!("rm({seq_id},{p0},{p1})"));
        }
        fn seq_add(&self, seq_id: SeqId, p0: i32, p1: i32, delta: i32) {
            self.calls.lock().unwrap().push(format!("add({seq_id},{p0},{p1},{delta})"));
        }
        fn seq_cp(&self, _: SeqId, _: SeqId, _: i32, _: i32) {
            unimplemented!()
        }
        fn seq_keep(&self, _: SeqId) {
            unimplemented!()
        }
        fn state_get(&self, _: SeqId) -> Result<Vec<u8>, BackendError> {
            unimplemented!()
        }
        fn state_set(&self, _: SeqId, _: &[u8]) -> Result<(), BackendError> {
            unimplemented!()
        }
        fn state_get_partial(&self, _: SeqId, _: i32, _: i32) -> Result<Vec<u8>, BackendError> {
            unimplemented!()
        }
        fn state_set_partial(&self, _: SeqId, _: &[u8]) -> Result<(), BackendError> {
            unimplemented!()
        }
        fn memory_can_shift(&self) -> bool {
            true
        }
        fn memory_uses_swa_or_recurrent(&self) -> bool {
            false
        }
        fn memory_swa_window(&self) -> i32 {
            0
        }
        fn memory_pos_min(&self, _: SeqId) -> Option<i32> {
            unimplemented!()
        }
        fn memory_pos_max(&self, _: SeqId) -> Option<i32> {
            unimplemented!()
        }
        async fn process_media_chunk(&self, _: &[u8], _: MediaKind, _: usize, _: SeqId) -> Result<(), BackendError> {
            unimplemented!()
        }
        fn set_adapter_lora(&self, _: SeqId, _: &[(String, f32)]) {
            unimplemented!()
        }
        fn is_multimodal(&self) -> bool {
            false
        }
        fn chat_template(&self) -> Option<&str> {
            unimplemented!()
        }
        fn apply_chat_template(&self, _: &str, _: Option<&str>, _: bool) -> Result<String, BackendError> {
            unimplemented!()
        }
    }

    fn buf(ids: &[i64]) -> TokenBuf {
        let mut b = TokenBuf::new(false);
        for &id in ids {
            b.push_text(id);
        }
        b
    }

    #[test]
    fn reuse_cached_chunks_shifts_matching_window_past_the_lcp() {
        // cached: [1,2,3,4,5,6], new: [1,2,9,4,5,6] — lcp stops at 2, but
        // [4,5,6] reappears past the mismatched "9" and should get reused.
        let mut cached = buf(&[1, 2, 3, 4, 5, 6]);
        let new = buf(&[1, 2, 9, 4, 5, 6]);
        let backend = RecordingBackend::default();
        let n_past = Scheduler::reuse_cached_chunks(&mut cached, &new, 0, 2, 3, &backend);
        assert_eq!(n_past, 5);
        // positions [2..5) were overwritten in place with the reused values;
        // only the first n_past entries matter (the caller truncates there).
        assert_eq!(&cached.raw_tokens()[..5], &[1, 2, 4, 5, 6]);
        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "rm(0,2,3)");
        assert_eq!(calls[1], "add(0,3,6,-1)");
    }

    #[test]
    fn reuse_cached_chunks_ignores_windows_below_threshold() {
        let mut cached = buf(&[1, 2, 3, 9, 9]);
        let new = buf(&[1, 2, 8, 9, 9]);
        let backend = RecordingBackend::default();
        // window [9,9] only has 2 matching tokens, below the n_cache_reuse=3 floor
        let n_past = Scheduler::reuse_cached_chunks(&mut cached, &new, 0, 2, 3, &backend);
        assert_eq!(n_past, 2);
        assert!(backend.calls.lock().unwrap().is_empty());
    }
}
