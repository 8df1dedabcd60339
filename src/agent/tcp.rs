use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use winci_protocol::{AGENT_PROTOCOL_MIN, ProtocolCompatibility, Request, Response, check_protocol_version};

use std::collections::HashMap;

use super::{AgentChannel, AgentDialer, WaitOutcome};
use crate::error::{Error, Result};

/// Resolves each VM name to its agent's `host:port` and dials a fresh
/// [`TcpAgentChannel`] on every call (the channel is not pooled: each task
/// worker or VLW action owns its connection for the lifetime of one
/// operation, then disconnects).
pub struct TcpAgentDialer {
    addresses: HashMap<String, (String, u16)>,
    connect_timeout: Duration,
}

impl TcpAgentDialer {
    pub fn new(addresses: HashMap<String, (String, u16)>, connect_timeout: Duration) -> Self {
        TcpAgentDialer {
            addresses,
            connect_timeout,
        }
    }
}

impl AgentDialer for TcpAgentDialer {
    fn dial(&self, vm: &str) -> Result<Box<dyn AgentChannel>> {
        let (host, port) = self.addresses.get(vm).ok_or_else(|| Error::AgentTransport {
            vm: vm.to_string(),
            message: "no agent address configured for this VM".to_string(),
        })?;
        let channel = TcpAgentChannel::connect(vm, (host.as_str(), *port), self.connect_timeout)?;
        Ok(Box::new(channel))
    }
}

/// Newline-delimited-JSON agent channel client, grounded on the broker's
/// own line-oriented framing: one `Request` per line out, one `Response`
/// per line back. Transport failures (I/O errors, a connection reset
/// mid-wait) are distinguished from in-guest errors (`Response::Err`).
pub struct TcpAgentChannel {
    vm: String,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    connect_timeout: Duration,
}

impl TcpAgentChannel {
    pub fn connect(vm: &str, addr: impl ToSocketAddrs, connect_timeout: Duration) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|err| Error::AgentTransport {
                vm: vm.to_string(),
                message: format!("failed to resolve agent address: {err}"),
            })?
            .next()
            .ok_or_else(|| Error::AgentTransport {
                vm: vm.to_string(),
                message: "agent address resolved to no candidates".to_string(),
            })?;
        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|err| Error::AgentTransport {
            vm: vm.to_string(),
            message: format!("failed to connect to agent: {err}"),
        })?;
        stream
            .set_read_timeout(Some(connect_timeout))
            .map_err(|err| Error::AgentTransport {
                vm: vm.to_string(),
                message: err.to_string(),
            })?;
        let reader_stream = stream.try_clone().map_err(|err| Error::AgentTransport {
            vm: vm.to_string(),
            message: err.to_string(),
        })?;
        let mut channel = TcpAgentChannel {
            vm: vm.to_string(),
            stream,
            reader: BufReader::new(reader_stream),
            connect_timeout,
        };
        channel.handshake()?;
        Ok(channel)
    }

    fn handshake(&mut self) -> Result<()> {
        let response = self.roundtrip(Request::Hello {
            protocol_version: AGENT_PROTOCOL_MIN.to_string(),
        })?;
        match response {
            Response::Hello { protocol_version } => {
                match check_protocol_version(&protocol_version) {
                    Ok(ProtocolCompatibility::Supported) => Ok(()),
                    Ok(other) => Err(Error::AgentTransport {
                        vm: self.vm.clone(),
                        message: format!("unsupported agent protocol version {protocol_version:?}: {other:?}"),
                    }),
                    Err(err) => Err(Error::AgentTransport {
                        vm: self.vm.clone(),
                        message: format!("malformed agent protocol version: {err}"),
                    }),
                }
            }
            other => Err(unexpected_response(&self.vm, other)),
        }
    }

    fn roundtrip(&mut self, request: Request) -> Result<Response> {
        let mut line = serde_json::to_string(&request).map_err(|err| Error::AgentTransport {
            vm: self.vm.clone(),
            message: format!("failed to encode request: {err}"),
        })?;
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .map_err(|err| Error::AgentTransport {
                vm: self.vm.clone(),
                message: format!("failed to send request: {err}"),
            })?;
        let mut response_line = String::new();
        let read = self
            .reader
            .read_line(&mut response_line)
            .map_err(|err| transport_or_timeout(&self.vm, err))?;
        if read == 0 {
            return Err(Error::AgentTransport {
                vm: self.vm.clone(),
                message: "agent closed the connection".to_string(),
            });
        }
        serde_json::from_str(response_line.trim()).map_err(|err| Error::AgentTransport {
            vm: self.vm.clone(),
            message: format!("failed to decode response: {err}"),
        })
    }
}

fn transport_or_timeout(vm: &str, err: std::io::Error) -> Error {
    if matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ) {
        Error::AgentWaitTimeout {
            vm: vm.to_string(),
            timeout_secs: 0,
        }
    } else {
        Error::AgentTransport {
            vm: vm.to_string(),
            message: format!("failed to read response: {err}"),
        }
    }
}

fn unexpected_response(vm: &str, response: Response) -> Error {
    Error::AgentTransport {
        vm: vm.to_string(),
        message: format!("unexpected agent response: {response:?}"),
    }
}

impl AgentChannel for TcpAgentChannel {
    fn set_time(&mut self, unix_secs: u64) -> Result<()> {
        match self.roundtrip(Request::SetTime { unix_secs })? {
            Response::Ok => Ok(()),
            Response::Err { message } => Err(Error::AgentGuest { vm: self.vm.clone(), message }),
            other => Err(unexpected_response(&self.vm, other)),
        }
    }

    fn send_file(&mut self, local_path: &Path, remote_path: &str, mode: u32) -> Result<()> {
        let bytes = std::fs::read(local_path).map_err(|err| Error::AgentTransport {
            vm: self.vm.clone(),
            message: format!("failed to read {}: {err}", local_path.display()),
        })?;
        self.send_bytes(&bytes, remote_path, mode)
    }

    fn send_file_from_string(&mut self, contents: &str, remote_path: &str, mode: u32) -> Result<()> {
        self.send_bytes(contents.as_bytes(), remote_path, mode)
    }

    /// `contents` on the wire is always base64, whether it originated as
    /// text (a generated driver script) or arbitrary bytes (a test
    /// binary) — a JSON string field can't carry raw bytes, and a
    /// `from_utf8`-or-fallback guess would leave the receiver unable to
    /// tell which encoding it got.
    fn send_bytes(&mut self, bytes: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        match self.roundtrip(Request::SendFileAsString {
            remote_path: remote_path.to_string(),
            mode,
            contents: BASE64.encode(bytes),
        })? {
            Response::Ok => Ok(()),
            Response::Err { message } => Err(Error::AgentGuest { vm: self.vm.clone(), message }),
            other => Err(unexpected_response(&self.vm, other)),
        }
    }

    fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        match self.roundtrip(Request::GetFile {
            remote_path: remote_path.to_string(),
        })? {
            Response::FileBytes { base64 } => {
                let bytes = BASE64.decode(base64.as_bytes()).map_err(|err| Error::AgentTransport {
                    vm: self.vm.clone(),
                    message: format!("invalid base64 from agent: {err}"),
                })?;
                std::fs::write(local_path, bytes).map_err(|err| Error::AgentTransport {
                    vm: self.vm.clone(),
                    message: format!("failed to write {}: {err}", local_path.display()),
                })
            }
            Response::Err { message } => Err(Error::AgentGuest { vm: self.vm.clone(), message }),
            other => Err(unexpected_response(&self.vm, other)),
        }
    }

    fn run(&mut self, argv: &[String]) -> Result<u32> {
        match self.roundtrip(Request::Run {
            argv: argv.to_vec(),
            cwd: None,
            env: Vec::new(),
        })? {
            Response::Pid { pid } => Ok(pid),
            Response::Err { message } => Err(Error::AgentGuest { vm: self.vm.clone(), message }),
            other => Err(unexpected_response(&self.vm, other)),
        }
    }

    fn wait(&mut self, pid: u32, timeout: Duration, keepalive: Duration) -> Result<WaitOutcome> {
        let started = Instant::now();
        self.stream
            .set_read_timeout(Some(keepalive.max(Duration::from_secs(1))))
            .map_err(|err| Error::AgentTransport {
                vm: self.vm.clone(),
                message: err.to_string(),
            })?;
        loop {
            match self.roundtrip(Request::Wait {
                pid,
                timeout_secs: keepalive.as_secs().max(1),
                keepalive_secs: keepalive.as_secs().max(1),
            }) {
                Ok(Response::ExitCode { code }) => return Ok(code),
                Ok(Response::Err { message }) => {
                    return Err(Error::AgentGuest { vm: self.vm.clone(), message });
                }
                Ok(other) => return Err(unexpected_response(&self.vm, other)),
                Err(Error::AgentWaitTimeout { .. }) => {
                    if started.elapsed() >= timeout {
                        return Ok(None);
                    }
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn ping(&mut self) -> Result<()> {
        match self.roundtrip(Request::Ping)? {
            Response::Ok => Ok(()),
            Response::Err { message } => Err(Error::AgentGuest { vm: self.vm.clone(), message }),
            other => Err(unexpected_response(&self.vm, other)),
        }
    }

    fn set_connect_timeout(&mut self, secs: u64) {
        self.connect_timeout = Duration::from_secs(secs);
    }

    fn disconnect(mut self: Box<Self>) -> Result<()> {
        let _ = self.roundtrip(Request::Disconnect);
        Ok(())
    }
}
