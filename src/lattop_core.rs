use std::time::Duration;

use anyhow::Result;

use crate::command_reader::CommandReader;
use crate::config::{Backend, Config};
use crate::event_loop::EventLoop;
use crate::events::SourceFilter;
use crate::lat_translator::LatTranslator;
use crate::perf_reader::PerfReader;
use crate::reader::{PolledReader, Session};
use crate::script_reader::ScriptReader;
use crate::signal_reader::SignalReader;
use crate::symbolize::SymbolTable;
use crate::timer_reader::TimerReader;
use crate::tracer_child::TracerArgs;

const REALTIME_PRIORITY: i32 = 10;

/// Run as SCHED_FIFO. Failure only warns.
pub fn set_realtime_priority() {
    let param = libc::sched_param {
        sched_priority: REALTIME_PRIORITY,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        tracing::warn!(
            "Failed to set SCHED_FIFO priority {}: {}",
            REALTIME_PRIORITY,
            std::io::Error::last_os_error()
        );
    }
}

fn load_symbols(config: &Config) -> SymbolTable {
    match SymbolTable::load(&config.kallsyms) {
        Ok(symbols) => {
            if symbols.is_empty() {
                tracing::warn!(
                    "No text symbols in {}, stacks will not be resolved. Is kptr_restrict set?",
                    config.kallsyms.display()
                );
            } else {
                tracing::info!("Loaded {} kernel symbols", symbols.len());
            }
            symbols
        }
        Err(e) => {
            tracing::warn!("{:#}", e);
            SymbolTable::default()
        }
    }
}

fn load_translations(config: &Config) -> LatTranslator {
    match LatTranslator::load(&config.translations) {
        Ok(translator) => {
            tracing::info!("Loaded {} translations", translator.len());
            translator
        }
        Err(e) => {
            tracing::warn!("{:#}, reporting raw stacks", e);
            LatTranslator::new()
        }
    }
}

fn stdin_is_terminal() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// Register the readers for the configured backend on `ev`.
pub fn register_readers(ev: &mut EventLoop, config: &Config) -> Result<()> {
    let filter = SourceFilter::from_config(config, std::process::id());
    let interval = Duration::from_secs(config.interval);
    let count = config.count;

    match config.backend {
        Backend::Perf => {
            ev.start_reader(Box::new(PerfReader::new(filter)))?;
            ev.start_reader(Box::new(TimerReader::new(interval, count)))?;
        }
        Backend::Script => {
            let args = TracerArgs {
                min_delay: config.min_delay,
                max_interruptible_delay: config.max_interruptible_delay,
                pid: config.pid_filter.unwrap_or(0),
            };
            ev.start_reader(Box::new(ScriptReader::new(
                config.tracer.clone(),
                config.script.clone(),
                args,
                filter,
            )))?;
            // Reports start once the tracer has compiled and attached.
            ev.on_producer_ready(move || {
                Box::new(TimerReader::new(interval, count)) as Box<dyn PolledReader>
            });
        }
    }

    ev.start_reader(Box::new(SignalReader::new()))?;
    if stdin_is_terminal() {
        ev.start_reader(Box::new(CommandReader::stdin()))?;
    }
    Ok(())
}

pub fn lattop(config: Config) -> Result<()> {
    let symbols = load_symbols(&config);
    let translator = load_translations(&config);
    let session = Session::new(symbols, translator, config.report_options());

    let mut ev = EventLoop::new(session);
    if let Err(e) = register_readers(&mut ev, &config) {
        ev.shutdown();
        return Err(e);
    }
    // After the tracer is forked so it keeps the normal policy.
    set_realtime_priority();
    ev.run()
}
