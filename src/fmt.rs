//! Log context and the simulated-time log formatter.
//!
//! Log lines carry the virtual clock and the active CPU instead of wall
//! time, e.g. `[      2_000_100 C01] DEBUG tick cpu=1`. The engine publishes
//! both into a per-thread context before it calls into the scheduler or a
//! task behavior.

use std::cell::Cell;
use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::types::{CpuId, TimeNs};

#[derive(Debug, Clone, Copy)]
struct LogContext {
    clock: TimeNs,
    cpu: Option<CpuId>,
    cpu_width: u8,
}

thread_local! {
    static LOG_CONTEXT: Cell<LogContext> = const {
        Cell::new(LogContext {
            clock: 0,
            cpu: None,
            cpu_width: 1,
        })
    };
}

fn update(f: impl FnOnce(&mut LogContext)) {
    LOG_CONTEXT.with(|c| {
        let mut ctx = c.get();
        f(&mut ctx);
        c.set(ctx);
    });
}

/// Virtual clock last published by the engine on this thread.
pub fn sim_clock() -> TimeNs {
    LOG_CONTEXT.with(|c| c.get().clock)
}

pub fn sim_cpu() -> Option<CpuId> {
    LOG_CONTEXT.with(|c| c.get().cpu)
}

pub fn sim_cpu_width() -> u8 {
    LOG_CONTEXT.with(|c| c.get().cpu_width)
}

pub fn set_sim_clock(clock: TimeNs, cpu: Option<CpuId>) {
    update(|ctx| {
        ctx.clock = clock;
        ctx.cpu = cpu;
    });
}

/// Pad CPU ids to the number of digits of the highest id.
pub fn set_sim_cpu_width(nr_cpus: usize) {
    let digits = nr_cpus.saturating_sub(1).max(1).ilog10() + 1;
    update(|ctx| ctx.cpu_width = digits as u8);
}

/// A virtual timestamp with thousands grouped by `_`, followed by the
/// active CPU (`C07`) or `-` outside of any CPU.
#[derive(Debug, Clone, Copy)]
pub struct FmtTs {
    pub ns: TimeNs,
    pub cpu: Option<CpuId>,
    pub width: u8,
}

impl FmtTs {
    pub fn new(ns: TimeNs, cpu: Option<CpuId>, width: u8) -> Self {
        Self { ns, cpu, width }
    }

    /// The timestamp as the engine last published it.
    pub fn now() -> Self {
        Self::new(sim_clock(), sim_cpu(), sim_cpu_width())
    }
}

pub(crate) fn group_thousands(v: u64) -> String {
    let digits = v.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() * 4 / 3);
    out.push_str(&digits[..lead]);
    for (i, chunk) in digits.as_bytes()[lead..].chunks(3).enumerate() {
        if lead > 0 || i > 0 {
            out.push('_');
        }
        out.extend(chunk.iter().map(|b| *b as char));
    }
    out
}

impl fmt::Display for FmtTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>15} ", group_thousands(self.ns))?;
        match self.cpu {
            Some(cpu) => write!(f, "C{:0w$}", cpu.0, w = self.width as usize),
            None => f.write_str("-"),
        }
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::ERROR => "31",
        Level::WARN => "33",
        Level::INFO => "32",
        Level::DEBUG => "34",
        Level::TRACE => "35",
    }
}

/// `tracing` event format keyed on simulated time.
pub struct SimFormat;

impl<S, N> FormatEvent<S, N> for SimFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        write!(writer, "[{}] ", FmtTs::now())?;
        if writer.has_ansi_escapes() {
            write!(writer, "\x1b[{}m{level:>5}\x1b[0m ", level_color(level))?;
        } else {
            write!(writer, "{level:>5} ")?;
        }

        let mut line = EventLine::default();
        event.record(&mut line);
        writeln!(writer, "{}{}", line.message, line.fields)
    }
}

/// The message of an event and its fields rendered as ` key=value`.
#[derive(Default)]
struct EventLine {
    message: String,
    fields: String,
}

impl Visit for EventLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    // Every other field type lands here through the default `Visit` impls.
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1_000), "1_000");
        assert_eq!(group_thousands(21_234_567), "21_234_567");
        assert_eq!(group_thousands(100_000), "100_000");
    }

    #[test]
    fn test_timestamp() {
        assert_eq!(FmtTs::new(100, None, 1).to_string(), "            100 -");
        assert_eq!(FmtTs::new(10_000, Some(CpuId(3)), 1).to_string(), "         10_000 C3");
        assert_eq!(
            FmtTs::new(20_000_000, Some(CpuId(1)), 2).to_string(),
            "     20_000_000 C01"
        );
    }

    #[test]
    fn test_log_context() {
        set_sim_clock(42, Some(CpuId(2)));
        assert_eq!(sim_clock(), 42);
        assert_eq!(sim_cpu(), Some(CpuId(2)));
        set_sim_cpu_width(24);
        assert_eq!(sim_cpu_width(), 2);
        set_sim_cpu_width(4);
        assert_eq!(sim_cpu_width(), 1);
        set_sim_cpu_width(1);
        assert_eq!(sim_cpu_width(), 1);
    }
}
