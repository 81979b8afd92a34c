use clap::Parser;

/// Fetch worker for one remote source directory.
///
/// The supervisor spawns one of these per directory and job slot; the
/// positional arguments pin the worker to its work area, host table slot
/// and directory alias.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Work area root (tables, retrieve lists, staging, logs).
    pub working_dir: std::path::PathBuf,
    /// Worker index: job slot in the host entry, 0-based.
    pub worker_index: usize,
    /// Host id the FSA position must still resolve to.
    pub fsa_id: u32,
    /// Position of the host entry in the FSA.
    pub fsa_pos: usize,
    /// Alias of the source directory in the FRA.
    pub dir_alias: String,

    /// Run as a distributed helper next to the scanning worker.
    #[clap(short = 'd', long = "distributed")]
    pub distributed: bool,

    /// Treat as an old-error job: grant the connect this many extra
    /// attempts, doubling the pause after each refusal, before giving up.
    #[clap(short = 'o', value_name = "RETRIES")]
    pub old_error_retries: Option<usize>,

    /// Dial the other side of a toggled host pair without flipping the
    /// stored toggle.
    #[clap(short = 't')]
    pub temp_toggle: bool,

    /// Log at debug level into the work area debug log.
    #[clap(long)]
    pub debug: bool,
}
