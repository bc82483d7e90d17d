//! UCI engine process management.
//!
//! `EngineProcess` owns one engine subprocess: it performs the UCI
//! handshake, probes the advertised options so only supported ones are
//! configured, runs single-position searches, and terminates the process
//! gracefully with a force-kill fallback.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shakmaty::{fen::Fen, Chess, EnPassantMode, Position};
use tokio::io::{AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vampirc_uci::{parse_one, UciInfoAttribute, UciMessage};

use crate::chess::score::{EngineScore, PovEval};
use crate::config::SearchLimit;
use crate::error::{Error, Result};

use super::uci::UciCommunicator;

/// Timeout for the `uci` handshake phase.
const ENGINE_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the `isready` handshake phase.
const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for graceful shutdown after `quit`.
const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of analysing a single position.
#[derive(Debug, Clone)]
pub struct PositionEval {
    /// Score from the side to move of the analysed position.
    pub eval: PovEval,
    /// Principal variation in UCI notation.
    pub pv: Vec<String>,
    /// Depth the score was reported at.
    pub depth: u32,
}

/// A running UCI engine process.
pub struct EngineProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    path: PathBuf,
    available_options: HashSet<String>,
}

impl EngineProcess {
    /// Spawn and initialize an engine, collecting its advertised options.
    pub async fn new(path: &Path) -> Result<Self> {
        let mut comm = UciCommunicator::spawn(path).await?;
        let mut available_options = HashSet::new();

        comm.write_line("uci\n").await?;
        let uciok = timeout(ENGINE_INIT_TIMEOUT, async {
            while let Some(line) = comm.stdout_lines.next_line().await? {
                match parse_one(&line) {
                    UciMessage::Option(config) => {
                        available_options.insert(config.get_name().to_string());
                    }
                    UciMessage::UciOk => return Ok::<_, Error>(true),
                    _ => {}
                }
            }
            Ok(false)
        })
        .await;

        match uciok {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(Error::EngineInit(
                    "engine closed before sending uciok".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::EngineInitTimeout),
        }

        comm.write_line("isready\n").await?;
        let readyok = timeout(ENGINE_READY_TIMEOUT, async {
            while let Some(line) = comm.stdout_lines.next_line().await? {
                if matches!(parse_one(&line), UciMessage::ReadyOk) {
                    return Ok::<_, Error>(true);
                }
            }
            Ok(false)
        })
        .await;

        match readyok {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(Error::EngineInit(
                    "engine closed before sending readyok".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::EngineInitTimeout),
        }

        info!("engine initialized: {:?}", path);
        Ok(Self {
            child: comm.child,
            stdin: comm.stdin,
            lines: comm.stdout_lines,
            path: path.to_path_buf(),
            available_options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the engine advertised a UCI option during the handshake.
    pub fn has_option(&self, name: &str) -> bool {
        self.available_options.contains(name)
    }

    /// Set UCI options, silently skipping ones the engine never advertised.
    pub async fn configure(&mut self, options: &[(&str, String)]) -> Result<()> {
        for (name, value) in options {
            if !self.has_option(name) {
                debug!("engine does not support option {}, skipping", name);
                continue;
            }
            self.write_line(&format!("setoption name {} value {}\n", name, value))
                .await?;
        }
        Ok(())
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("engine process has exited with status: {:?}", status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("error checking engine process status: {}", e);
                true
            }
        }
    }

    /// Analyse a single position within the given search budget.
    ///
    /// Returns the last scored `info` the engine produced before
    /// `bestmove`. Errors if the process exits mid-search.
    pub async fn analyse(&mut self, pos: &Chess, limit: SearchLimit) -> Result<PositionEval> {
        let fen = Fen::from_position(pos.clone(), EnPassantMode::Legal).to_string();
        self.write_line(&format!("position fen {}\n", fen)).await?;

        let go = match limit {
            SearchLimit::Depth(depth) => format!("go depth {}\n", depth),
            SearchLimit::MoveTime(time) => format!("go movetime {}\n", time.as_millis()),
        };
        self.write_line(&go).await?;

        let mut score = None;
        let mut pv: Vec<String> = Vec::new();
        let mut depth = 0u32;

        loop {
            let line = match self.lines.next_line().await? {
                Some(line) => line,
                None => return Err(Error::EngineTerminated),
            };
            match parse_one(&line) {
                UciMessage::Info(attrs) => {
                    let mut line_score = None;
                    let mut line_pv = None;
                    let mut line_depth = None;
                    for attr in attrs {
                        match attr {
                            UciInfoAttribute::Score { cp, mate, .. } => {
                                if let Some(mate) = mate {
                                    line_score = Some(EngineScore::Mate(i32::from(mate)));
                                } else if let Some(cp) = cp {
                                    line_score = Some(EngineScore::Cp(cp));
                                }
                            }
                            UciInfoAttribute::Pv(moves) => {
                                line_pv =
                                    Some(moves.iter().map(ToString::to_string).collect::<Vec<_>>());
                            }
                            UciInfoAttribute::Depth(d) => {
                                line_depth = Some(u32::from(d));
                            }
                            _ => {}
                        }
                    }
                    // Only scored lines advance the result; bare node-count
                    // updates and "info string" chatter are ignored.
                    if let Some(s) = line_score {
                        score = Some(s);
                        if let Some(p) = line_pv {
                            pv = p;
                        }
                        if let Some(d) = line_depth {
                            depth = d;
                        }
                    }
                }
                UciMessage::BestMove { .. } => break,
                _ => {}
            }
        }

        Ok(PositionEval {
            eval: PovEval::new(score.unwrap_or(EngineScore::Cp(0)), pos.turn()),
            pv,
            depth,
        })
    }

    /// Ask the engine to quit, force-killing it if it lingers.
    pub async fn quit(&mut self) -> Result<()> {
        if let Err(e) = self.write_line("quit\n").await {
            warn!("failed to send quit command to engine: {}", e);
        }

        match timeout(ENGINE_QUIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("engine process exited with status: {:?}", status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("error waiting for engine process: {}", e);
                self.child.kill().await?;
                Ok(())
            }
            Err(_) => {
                warn!("engine did not exit after quit, force-killing");
                self.child.kill().await?;
                let _ = self.child.wait().await;
                Ok(())
            }
        }
    }

    /// Terminate the process immediately. Used when a search is presumed
    /// hung and the stdin channel can no longer be trusted.
    pub async fn kill(&mut self) -> Result<()> {
        info!("killing engine process {:?}", self.path);
        if let Err(e) = self.child.kill().await {
            warn!("failed to kill engine process: {}", e);
        }
        let _ = self.child.wait().await;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("[engine-stdin] {}", line.trim_end());
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}
