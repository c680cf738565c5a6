//! Process-wide logger: ANSI-coloured, level-tagged, annotated with the
//! source location, and toggleable at run time.
use std::io::Write;
use std::sync::Once;

use log::LevelFilter;

static INSTALL: Once = Once::new();

/// Install the log sink (idempotent) and apply the `verbose` toggle.
///
/// Records are rendered as `<timestamp> [LEVEL] message [file:line]`, with
/// the level coloured on capable terminals. Output goes to stderr and never
/// blocks task execution under normal conditions.
pub fn init_logger(verbose: bool) {
    INSTALL.call_once(|| {
        env_logger::Builder::from_default_env()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "<{}> [{}] {} [{}:{}]",
                    buf.timestamp(),
                    buf.default_styled_level(record.level()),
                    record.args(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                )
            })
            .filter_level(LevelFilter::Trace)
            .init();
    });
    set_verbose(verbose);
}

/// Process-wide logging toggle.
pub fn set_verbose(on: bool) {
    log::set_max_level(if on {
        LevelFilter::Trace
    } else {
        LevelFilter::Off
    });
}
