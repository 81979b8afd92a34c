use std::fs::OpenOptions;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{Receiver, bounded};
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use getferry::FetchError;
use getferry::cli::Cli;
use getferry::config::WorkArea;
use getferry::fetch::Fetcher;
use getferry::keepalive::{Arbiter, KeepAliveDecision};
use getferry::parse::{Scheme, parse_source_url};
use getferry::remote::{FtpSource, RemoteSource, SessionConfig};
use getferry::report::{self, LogSinks, Severity};
use getferry::rlist::{AttachMode, RlistHandle};
use getferry::scan::{ProcAdmission, Scanner, admit_destructive_scan};
use getferry::table::TableCheck;
use getferry::table::fra::{FraHandle, ReacquirePolicy};
use getferry::table::fsa::{CONNECTED, FsaHandle};

fn main() {
    let cli = Cli::parse();
    let area = WorkArea::new(&cli.working_dir);
    init_tracing(&area, cli.debug);

    // one registered teardown path: the signal handler feeds a channel the
    // keep-alive arbiter and the stream loop both select on
    let (cancel_tx, cancel_rx) = bounded::<()>(1);
    let _ = ctrlc::set_handler(move || {
        let _ = cancel_tx.try_send(());
    });

    let code = match run(&cli, &area, &cancel_rx) {
        Ok(()) => 0,
        Err(err) => {
            let code = FetchError::from_anyhow(&err).map_or(1, FetchError::exit_code);
            if code != 0 {
                tracing::error!("worker {} failed: {:#}", cli.worker_index, err);
                eprintln!("gf: {:#}", err);
            }
            code
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli, area: &WorkArea, cancel: &Receiver<()>) -> Result<()> {
    area.ensure_tables()?;

    let mut fra = FraHandle::attach(&area.fra_path(), &cli.dir_alias)?;
    let mut fsa =
        FsaHandle::attach(&area.fsa_path(), cli.fsa_pos, cli.fsa_id, cli.worker_index)?;
    let mut sinks = LogSinks::open(&area.workdir, fsa.entry().alias(), cli.worker_index)?;

    let mut rlist =
        RlistHandle::attach(&area.rlist_path(fra.dir_id()), AttachMode::CreateIfMissing)?;

    // destructive policies admit one working process per list
    let policy = fra.entry().policy();
    let remove = fra.entry().remove != 0;
    let admission = match admit_destructive_scan(&rlist, policy, remove)? {
        ProcAdmission::OtherProcessActive => {
            tracing::debug!("[gf] {}: another process works this list", cli.dir_alias);
            return Ok(());
        }
        other => other,
    };

    let url = parse_source_url(fra.entry().url_str())?;
    if url.scheme != Scheme::Ftp {
        return Err(FetchError::Incorrect(format!(
            "scheme of {} is handled by a different worker class",
            fra.entry().url_str()
        ))
        .into());
    }
    let dial_host = {
        let name = fsa.entry().dial_hostname(cli.temp_toggle).to_string();
        if name.is_empty() { url.host.clone() } else { name }
    };
    let session_cfg = SessionConfig {
        host: dial_host,
        port: url.port,
        user: url.user.clone(),
        password: url.password.clone(),
        path: url.path.clone(),
        timeout: Duration::from_secs(u64::from(fsa.entry().transfer_timeout.max(10))),
    };

    fsa.register_transfer(std::process::id() as i32)?;
    let result = run_session(
        cli,
        area,
        cancel,
        &mut fra,
        &mut fsa,
        &mut rlist,
        &mut sinks,
        &session_cfg,
        &admission,
    );
    // release the slot on every exit path, floor honoured on double runs
    let _ = fsa.deregister_transfer();
    sinks.flush();
    result
}

#[allow(clippy::too_many_arguments)]
fn run_session(
    cli: &Cli,
    area: &WorkArea,
    cancel: &Receiver<()>,
    fra: &mut FraHandle,
    fsa: &mut FsaHandle,
    rlist: &mut RlistHandle,
    sinks: &mut LogSinks,
    session_cfg: &SessionConfig,
    admission: &ProcAdmission,
) -> Result<()> {
    let mut source = connect_with_retries(cli, fra, fsa, sinks, session_cfg)?;
    fsa.job_mut().connect_status = CONNECTED;
    sinks.transfer(Severity::Debug, &format!("OPEN session {}", session_cfg.host));

    let outcome = loop {
        if cancel.try_recv().is_ok() {
            let _ = source.quit();
            return Err(FetchError::GotKilled.into());
        }
        match (fra.check(), fsa.check()) {
            (TableCheck::Gone, _) => {
                let _ = source.quit();
                return Err(FetchError::StaleHandle("directory".into()).into());
            }
            (_, TableCheck::Gone) => {
                let _ = source.quit();
                return Err(FetchError::StaleHandle("host".into()).into());
            }
            _ => {}
        }

        let scanned = {
            let mut scanner = Scanner {
                fra: &mut *fra,
                fsa: &mut *fsa,
                rlist: &mut *rlist,
                sinks: &mut *sinks,
                worker_id: cli.worker_index as u32,
                distributed_helper: cli.distributed,
            };
            match scanner.scan(&mut source) {
                Ok(out) => out,
                Err(e) => {
                    if is_reportable(&e) {
                        report::record_failure(fra, fsa, sinks, &format!("scan failed: {:#}", e))?;
                    }
                    let _ = source.quit();
                    return Err(e);
                }
            }
        };

        let fetched = {
            let mut fetcher = Fetcher {
                fra: &mut *fra,
                fsa: &mut *fsa,
                rlist: &mut *rlist,
                sinks: &mut *sinks,
                worker_id: cli.worker_index as u32,
                staging_dir: area.staging_dir(&cli.dir_alias),
                cancel,
            };
            match fetcher.drain(&mut source) {
                Ok(out) => out,
                Err(e) => {
                    if is_reportable(&e) {
                        report::record_failure(fra, fsa, sinks, &format!("fetch failed: {:#}", e))?;
                    }
                    let _ = source.quit();
                    return Err(e);
                }
            }
        };
        if fetched.files_fetched > 0 {
            let mib = fetched.bytes_fetched as f64 / 1024.0 / 1024.0;
            sinks.transfer(
                Severity::Info,
                &format!(
                    "cycle done: {} files, {} bytes ({:.2} MiB)",
                    fetched.files_fetched, fetched.bytes_fetched, mib
                ),
            );
        }

        // in remove mode nothing in the list outlives a drained cycle; the
        // admission guard is the proof we are the one working process
        let policy = fra.entry().policy();
        if (policy == ReacquirePolicy::Remove || fra.entry().remove != 0)
            && fetched.files_fetched > 0
        {
            if let ProcAdmission::Held(guard) = admission {
                rlist.reset(guard)?;
            }
        }

        let decision = {
            let mut arbiter = Arbiter { fra: &mut *fra, fsa: &mut *fsa, cancel };
            arbiter.decide(&mut source, scanned.more_files_in_list)?
        };
        if decision == KeepAliveDecision::Disconnect {
            break fetched;
        }
    };

    let _ = source.quit();
    sinks.transfer(
        Severity::Debug,
        &format!("CLOSE session {} after {} files", session_cfg.host, outcome.files_fetched),
    );
    Ok(())
}

/// Kills and topology changes are clean exits, not host errors.
fn is_reportable(err: &anyhow::Error) -> bool {
    !matches!(
        FetchError::from_anyhow(err),
        Some(FetchError::GotKilled | FetchError::StaleHandle(_))
    )
}

/// Old-error jobs get a bounded ladder of reconnect attempts, doubling
/// the pause after each refused connect; everything else fails on the
/// first one. A terminal connect failure runs through the same failure
/// recording as scan and fetch errors, so a chronically unreachable host
/// escalates its directory too.
fn connect_with_retries(
    cli: &Cli,
    fra: &mut FraHandle,
    fsa: &mut FsaHandle,
    sinks: &mut LogSinks,
    session_cfg: &SessionConfig,
) -> Result<FtpSource> {
    let attempts = 1 + cli.old_error_retries.unwrap_or(0);
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..attempts {
        match FtpSource::connect(session_cfg) {
            Ok(s) => return Ok(s),
            Err(e) => {
                let retriable =
                    FetchError::from_anyhow(&e).is_some_and(FetchError::is_retriable_pre_transfer);
                sinks.transfer_with_origin(
                    Severity::Warn,
                    &format!("connect attempt {} failed: {:#}", attempt + 1, e),
                    file!(),
                    line!(),
                );
                last_err = Some(e);
                if !retriable || attempt + 1 >= attempts {
                    break;
                }
                // 100ms, 200ms, 400ms, ... capped so a large -o stays sane
                std::thread::sleep(Duration::from_millis(100u64 << attempt.min(6)));
            }
        }
    }
    let err = last_err.unwrap_or_else(|| {
        FetchError::ConnectError(format!("{}:{}", session_cfg.host, session_cfg.port)).into()
    });
    report::record_failure(fra, fsa, sinks, &format!("connect failed: {:#}", err))?;
    Err(err)
}

fn init_tracing(area: &WorkArea, debug: bool) {
    // all tracing output goes into the work area debug log; the transfer,
    // delete and event logs are fixed-format files owned by the report
    // module and never run through tracing
    let log_dir = area.log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("debug.log");
    let level_str = if debug { "debug" } else { "warn" };
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (writer, guard) = non_blocking(file);
            // keep the background writer alive for the whole process
            let _ = Box::leak(Box::new(guard));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
        }
    }
}
