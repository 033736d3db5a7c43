//! Runs one dispatched program wave by wave.
//!
//! Commands of a wave have no dependencies on each other. With
//! `concurrent_commands` enabled a wave with more than one command is split
//! across scoped threads; otherwise commands run in command-id order. The
//! first failure stops every later wave; commands already running in the
//! same wave finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anvil_core::{ExecutorConfig, HalError, ResultCode};
use parking_lot::Mutex;

use crate::command::ExecContext;
use crate::command_buffer::{DispatchSnapshot, Program};

struct Failure {
    index: usize,
    error: HalError,
}

pub(crate) fn execute(config: &ExecutorConfig, ctx: &ExecContext<'_>, snapshot: &DispatchSnapshot) -> ResultCode {
    let program = &snapshot.program;
    let failed = AtomicBool::new(false);
    let failure: Mutex<Option<Failure>> = Mutex::new(None);

    for wave in program.plan.waves() {
        let threads = config.max_command_threads.max(1).min(wave.len());
        if config.concurrent_commands && threads > 1 {
            let chunk = wave.len().div_ceil(threads);
            let (failed, failure) = (&failed, &failure);
            thread::scope(|scope| {
                for part in wave.chunks(chunk) {
                    scope.spawn(move || run_sequence(program, part, ctx, failed, failure));
                }
            });
        } else {
            run_sequence(program, wave, ctx, &failed, &failure);
        }
        if failed.load(Ordering::Acquire) {
            break;
        }
    }

    match failure.into_inner() {
        None => ResultCode::Success,
        Some(Failure { index, error }) => {
            let kind = program.commands[index].command.kind();
            let message = format!(
                "command {index} ({kind:?}) of {} failed: {error}",
                snapshot.command_buffer
            );
            tracing::error!("{}", message);
            if let Some(callback) = &snapshot.message_callback {
                callback(&message, &(index as u32).to_le_bytes());
            }
            error.code()
        }
    }
}

fn run_sequence(
    program: &Program,
    indices: &[usize],
    ctx: &ExecContext<'_>,
    failed: &AtomicBool,
    failure: &Mutex<Option<Failure>>,
) {
    for &index in indices {
        if failed.load(Ordering::Acquire) {
            return;
        }
        let command = &program.commands[index].command;
        let start = Instant::now();
        let result = command.execute(index as u32, ctx);
        if !command.is_query() {
            ctx.counters
                .record_command(start.elapsed().as_nanos() as u64);
        }
        if let Err(error) = result {
            failed.store(true, Ordering::Release);
            let mut slot = failure.lock();
            if slot.as_ref().map_or(true, |first| index < first.index) {
                *slot = Some(Failure { index, error });
            }
            return;
        }
    }
}
