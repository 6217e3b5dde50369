//! Process-wide tracing setup with a live-adjustable level.

use std::sync::atomic::{AtomicI32, Ordering};

use once_cell::sync::OnceCell;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();
static CURRENT_IDX: AtomicI32 = AtomicI32::new(2); // 0=error,1=warn,2=info,3=debug,4=trace

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Install the global subscriber. `RUST_LOG` wins over `default` when set.
///
/// Returns false if another subscriber was installed first; the level
/// controls below are then no-ops.
pub fn init(default: LevelFilter) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    let (filter, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    if installed {
        set_reload_handle(handle, default);
    }
    installed
}

pub fn set_reload_handle(handle: reload::Handle<EnvFilter, Registry>, initial: LevelFilter) {
    let _ = RELOAD.set(handle);
    CURRENT_IDX.store(level_to_idx(initial), Ordering::Relaxed);
}

pub fn increase_verbosity() -> Option<LevelFilter> {
    adjust_by(1)
}

pub fn decrease_verbosity() -> Option<LevelFilter> {
    adjust_by(-1)
}

/// Replace the live filter with a single global level.
pub fn set_level(level: LevelFilter) -> Option<LevelFilter> {
    let handle = RELOAD.get()?;
    CURRENT_IDX.store(level_to_idx(level), Ordering::Relaxed);
    handle.reload(EnvFilter::new(level_to_str(level))).ok()?;
    Some(level)
}

pub fn current_level() -> LevelFilter {
    LEVELS[CURRENT_IDX.load(Ordering::Relaxed).clamp(0, 4) as usize]
}

fn adjust_by(delta: i32) -> Option<LevelFilter> {
    RELOAD.get()?;
    let idx = (CURRENT_IDX.load(Ordering::Relaxed) + delta).clamp(0, 4);
    set_level(LEVELS[idx as usize])
}

fn level_to_idx(level: LevelFilter) -> i32 {
    LEVELS.iter().position(|candidate| *candidate == level).map_or(2, |idx| idx as i32)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
        _ => "off",
    }
}
