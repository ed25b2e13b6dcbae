use log::LevelFilter;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub fn parse_level(level: &str) -> Result<LevelFilter, String> {
    LevelFilter::from_str(level).map_err(|_| format!("Unknown log level: {}", level))
}

/// Installs the global logger: timestamped lines on stdout, mirrored to
/// `file` when one is given.
pub fn set_up_logger(level: LevelFilter, file: Option<&Path>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());
    if let Some(path) = file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}
