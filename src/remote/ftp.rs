//! Control-channel client for the classic file-transfer protocol.
//!
//! One TCP control connection carries the command dialogue; every listing
//! and body transfer opens a fresh passive-mode data connection. Replies
//! are `nnn text`, with multi-line replies bracketed by `nnn-` ... `nnn `.
//! A 500/502 on a metadata probe downgrades the session capability flag
//! instead of failing the file.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;

use super::Probe;
use crate::error::FetchError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything needed to dial and log in to one source.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Remote directory to change into after login; empty stays put.
    pub path: String,
    /// Socket read/write timeout; derived from the host transfer timeout.
    pub timeout: Duration,
}

pub struct FtpSource {
    ctrl: BufReader<TcpStream>,
    /// Data connection of a transfer in flight, kept so `retrieve_done`
    /// can collect the completion reply after the caller drops the reader.
    in_transfer: bool,
    date_supported: bool,
    size_supported: bool,
    peer: String,
}

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// Permanent-negative family on a probe downgrades the session
    /// capability instead of failing the file; 4xx and transport errors
    /// stay transient.
    fn is_not_supported(&self) -> bool {
        self.code >= 500
    }
}

fn io_err(peer: &str, what: &str, e: &std::io::Error) -> FetchError {
    if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
        FetchError::TimeoutError(format!("{} during {}", peer, what))
    } else {
        FetchError::ConnectError(format!("{} during {}: {}", peer, what, e))
    }
}

impl FtpSource {
    /// Dial, read the greeting, log in and switch to binary mode.
    pub fn connect(cfg: &SessionConfig) -> Result<Self> {
        let peer = format!("{}:{}", cfg.host, cfg.port);
        let sock = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .map_err(|e| FetchError::ConnectError(format!("{}: {}", peer, e)))?
            .next()
            .ok_or_else(|| FetchError::ConnectError(format!("{}: no address", peer)))?;
        let stream = TcpStream::connect_timeout(&sock, CONNECT_TIMEOUT)
            .map_err(|e| FetchError::ConnectError(format!("{}: {}", peer, e)))?;
        let _ = stream.set_read_timeout(Some(cfg.timeout));
        let _ = stream.set_write_timeout(Some(cfg.timeout));
        let mut session = Self {
            ctrl: BufReader::new(stream),
            in_transfer: false,
            date_supported: true,
            size_supported: true,
            peer,
        };
        let greeting = session.read_reply("greeting")?;
        if greeting.code != 220 {
            return Err(FetchError::ConnectError(format!(
                "{}: unexpected greeting {} {}",
                session.peer, greeting.code, greeting.text
            ))
            .into());
        }
        session.login(&cfg.user, &cfg.password)?;
        let tb = session.command("TYPE I", "type")?;
        if !tb.is_positive() {
            return Err(FetchError::ConnectError(format!(
                "{}: TYPE I refused: {} {}",
                session.peer, tb.code, tb.text
            ))
            .into());
        }
        if !cfg.path.is_empty() {
            let cwd = session.command(&format!("CWD {}", cfg.path), "cwd")?;
            if !cwd.is_positive() {
                return Err(FetchError::ConnectError(format!(
                    "{}: CWD {} refused: {} {}",
                    session.peer, cfg.path, cwd.code, cwd.text
                ))
                .into());
            }
        }
        Ok(session)
    }

    fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let reply = self.command(&format!("USER {}", user), "login")?;
        let reply = match reply.code {
            331 => self.command(&format!("PASS {}", password), "login")?,
            _ => reply,
        };
        if reply.is_positive() {
            Ok(())
        } else {
            Err(FetchError::ConnectError(format!(
                "{}: login rejected: {} {}",
                self.peer, reply.code, reply.text
            ))
            .into())
        }
    }

    fn send(&mut self, line: &str, what: &str) -> Result<()> {
        let stream = self.ctrl.get_mut();
        stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .map_err(|e| io_err(&self.peer, what, &e))?;
        Ok(())
    }

    fn read_reply(&mut self, what: &str) -> Result<Reply> {
        let mut line = String::new();
        let n = self.ctrl.read_line(&mut line).map_err(|e| io_err(&self.peer, what, &e))?;
        if n == 0 {
            return Err(FetchError::ConnectError(format!(
                "{}: connection closed during {}",
                self.peer, what
            ))
            .into());
        }
        let code: u16 = line.get(..3).and_then(|s| s.parse().ok()).ok_or_else(|| {
            FetchError::ConnectError(format!("{}: garbled reply '{}'", self.peer, line.trim_end()))
        })?;
        let mut text = line.get(4..).unwrap_or("").trim_end().to_string();
        if line.as_bytes().get(3) == Some(&b'-') {
            // multi-line: read until the terminating "nnn " line
            let terminator = format!("{:03} ", code);
            loop {
                let mut cont = String::new();
                let n =
                    self.ctrl.read_line(&mut cont).map_err(|e| io_err(&self.peer, what, &e))?;
                if n == 0 {
                    return Err(FetchError::ConnectError(format!(
                        "{}: connection closed inside reply",
                        self.peer
                    ))
                    .into());
                }
                if cont.starts_with(&terminator) {
                    text.push('\n');
                    text.push_str(cont[4..].trim_end());
                    break;
                }
                text.push('\n');
                text.push_str(cont.trim_end());
            }
        }
        Ok(Reply { code, text })
    }

    fn command(&mut self, line: &str, what: &str) -> Result<Reply> {
        self.send(line, what)?;
        self.read_reply(what)
    }

    /// Enter passive mode and connect the data channel.
    fn open_data(&mut self, what: &str) -> Result<TcpStream> {
        let reply = self.command("PASV", what)?;
        if reply.code != 227 {
            return Err(FetchError::ConnectError(format!(
                "{}: PASV refused: {} {}",
                self.peer, reply.code, reply.text
            ))
            .into());
        }
        let addr = parse_pasv(&reply.text).ok_or_else(|| {
            FetchError::ConnectError(format!("{}: garbled PASV reply '{}'", self.peer, reply.text))
        })?;
        let timeout = self.ctrl.get_ref().read_timeout().ok().flatten();
        let data = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| FetchError::ConnectError(format!("{} data channel: {}", self.peer, e)))?;
        let _ = data.set_read_timeout(timeout);
        let _ = data.set_write_timeout(timeout);
        Ok(data)
    }
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` → socket address.
fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let nums: Vec<u8> =
        text[open + 1..close].split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) << 8 | u16::from(nums[5]);
    Some(SocketAddr::new(ip, port))
}

/// `213 YYYYMMDDHHMMSS` → unix seconds.
fn parse_mdtm(text: &str) -> Option<i64> {
    let stamp = text.split_whitespace().next()?;
    let dt = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    Some(dt.and_utc().timestamp())
}

impl super::RemoteSource for FtpSource {
    fn list(&mut self) -> Result<Vec<String>> {
        let data = self.open_data("list")?;
        let reply = self.command("NLST", "list")?;
        match reply.code {
            125 | 150 => {}
            // no files is a valid empty listing, not a protocol failure
            450 | 550 => {
                drop(data);
                return Ok(Vec::new());
            }
            _ => {
                return Err(FetchError::ListError(format!(
                    "{}: NLST: {} {}",
                    self.peer, reply.code, reply.text
                ))
                .into());
            }
        }
        let mut names = Vec::new();
        let mut rdr = BufReader::new(data);
        let mut line = String::new();
        loop {
            line.clear();
            let n = rdr.read_line(&mut line).map_err(|e| io_err(&self.peer, "list", &e))?;
            if n == 0 {
                break;
            }
            let name = line.trim_end_matches(['\r', '\n']);
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
        drop(rdr);
        let done = self.read_reply("list")?;
        if !done.is_positive() {
            return Err(FetchError::ListError(format!(
                "{}: NLST close: {} {}",
                self.peer, done.code, done.text
            ))
            .into());
        }
        Ok(names)
    }

    fn mtime(&mut self, name: &str) -> Result<Probe<i64>> {
        if !self.date_supported {
            return Ok(Probe::NotSupported);
        }
        let reply = self.command(&format!("MDTM {}", name), "date probe")?;
        if reply.is_not_supported() {
            self.date_supported = false;
            return Ok(Probe::NotSupported);
        }
        if reply.code != 213 {
            return Err(FetchError::DateError(
                name.to_string(),
                format!("{} {}", reply.code, reply.text),
            )
            .into());
        }
        parse_mdtm(&reply.text).map(Probe::Known).ok_or_else(|| {
            FetchError::DateError(name.to_string(), format!("garbled stamp '{}'", reply.text))
                .into()
        })
    }

    fn size(&mut self, name: &str) -> Result<Probe<i64>> {
        if !self.size_supported {
            return Ok(Probe::NotSupported);
        }
        let reply = self.command(&format!("SIZE {}", name), "size probe")?;
        if reply.is_not_supported() {
            self.size_supported = false;
            return Ok(Probe::NotSupported);
        }
        if reply.code != 213 {
            return Err(FetchError::SizeError(
                name.to_string(),
                format!("{} {}", reply.code, reply.text),
            )
            .into());
        }
        reply
            .text
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Probe::Known)
            .ok_or_else(|| {
                FetchError::SizeError(name.to_string(), format!("garbled size '{}'", reply.text))
                    .into()
            })
    }

    fn retrieve(&mut self, name: &str, offset: i64) -> Result<Box<dyn Read + Send>> {
        let data = self.open_data("retrieve")?;
        if offset > 0 {
            let reply = self.command(&format!("REST {}", offset), "retrieve")?;
            if reply.code != 350 {
                return Err(FetchError::ReadRemoteError(
                    name.to_string(),
                    format!("REST {} refused: {} {}", offset, reply.code, reply.text),
                )
                .into());
            }
        }
        let reply = self.command(&format!("RETR {}", name), "retrieve")?;
        if reply.code != 125 && reply.code != 150 {
            return Err(FetchError::ReadRemoteError(
                name.to_string(),
                format!("{} {}", reply.code, reply.text),
            )
            .into());
        }
        self.in_transfer = true;
        Ok(Box::new(data))
    }

    fn retrieve_done(&mut self) -> Result<()> {
        if !self.in_transfer {
            return Ok(());
        }
        self.in_transfer = false;
        let reply = self.read_reply("transfer end")?;
        if reply.is_positive() {
            Ok(())
        } else {
            Err(FetchError::ReadRemoteError(
                String::new(),
                format!("{}: transfer end: {} {}", self.peer, reply.code, reply.text),
            )
            .into())
        }
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        let reply = self.command(&format!("DELE {}", name), "delete")?;
        if reply.code == 250 {
            Ok(())
        } else {
            Err(FetchError::DeleteRemoteError(
                name.to_string(),
                format!("{} {}", reply.code, reply.text),
            )
            .into())
        }
    }

    fn noop(&mut self) -> Result<()> {
        let reply = self.command("NOOP", "noop")?;
        if reply.is_positive() {
            Ok(())
        } else {
            Err(FetchError::TimeoutError(format!(
                "{}: NOOP: {} {}",
                self.peer, reply.code, reply.text
            ))
            .into())
        }
    }

    fn quit(&mut self) -> Result<()> {
        // best effort: the server may already have dropped us
        let _ = self.send("QUIT", "quit");
        let _ = self.read_reply("quit");
        Ok(())
    }

    fn probe_date_supported(&self) -> bool {
        self.date_supported
    }

    fn probe_size_supported(&self) -> bool {
        self.size_supported
    }
}
