//! Command-line surface, grounded on spec.md §6.4 and
//! `original_source/dnsproxy.cpp::main`'s manual `argv` scan, expressed as
//! a `clap` derive per the teacher's `cli.rs`.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "dnsfilterd", about = "Filtering DNS proxy", version)]
pub struct Cli {
    /// Configuration file path (defaults to ./dnsfilterd.ini, then /etc/dnsfilterd.ini)
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,

    /// Stay in the foreground and log to the console instead of daemonizing
    #[arg(short = 'L', long = "console")]
    pub console: bool,

    /// Raise the debug flag (extra diagnostic logging)
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Log the raw bytes of every client-facing query/reply
    #[arg(long = "vcb")]
    pub verbose_client_binary: bool,

    /// Log the raw bytes of every upstream-facing query/reply
    #[arg(long = "vsb")]
    pub verbose_server_binary: bool,

    /// Log every policy SQL statement issued
    #[arg(long = "vdb")]
    pub verbose_database: bool,
}

impl Cli {
    /// Parses `argv`, first normalizing the `-VCB`/`-VSB`/`-VDB` tokens so
    /// they're recognized regardless of case or dash count, per spec.md
    /// §6.4.
    pub fn parse_args() -> Cli {
        Cli::parse_from(normalize_verbosity_flags(std::env::args()))
    }

    /// Folds the `-VCB`/`-VSB`/`-VDB` verbosity flags into the loaded
    /// config's `Logging` group, matching the original's behavior of
    /// incrementing the same counters the INI file sets.
    pub fn apply_overrides(&self, config: &mut crate::config::ConfigFile) {
        if self.verbose_client_binary {
            config.logging.client_binary = 1;
        }
        if self.verbose_server_binary {
            config.logging.server_binary = 1;
        }
        if self.verbose_database {
            config.logging.database = 1;
        }
    }
}

/// Rewrites any case-insensitive, any-dash-count spelling of `vcb`/`vsb`/`vdb`
/// (`-VCB`, `--VCB`, `-vcb`, ...) to the canonical `--vcb`/`--vsb`/`--vdb`
/// clap recognizes, per `original_source/dnsproxy.cpp`'s case-insensitive
/// `argv` scan for these three tokens. Every other argument passes through
/// untouched.
fn normalize_verbosity_flags<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if !arg.starts_with('-') {
                return arg;
            }
            match arg.trim_start_matches('-').to_ascii_lowercase().as_str() {
                "vcb" => "--vcb".to_string(),
                "vsb" => "--vsb".to_string(),
                "vdb" => "--vdb".to_string(),
                _ => arg,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_dash_count() {
        let normalized = normalize_verbosity_flags(
            ["dnsfilterd", "-VCB", "--VSB", "-vdb"].iter().map(|s| s.to_string()),
        );
        assert_eq!(normalized, vec!["dnsfilterd", "--vcb", "--vsb", "--vdb"]);
    }

    #[test]
    fn leaves_other_arguments_untouched() {
        let normalized =
            normalize_verbosity_flags(["dnsfilterd", "-c", "dnsfilterd.ini"].iter().map(|s| s.to_string()));
        assert_eq!(normalized, vec!["dnsfilterd", "-c", "dnsfilterd.ini"]);
    }
}
