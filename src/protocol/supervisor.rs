use std::{
    io::{self, BufRead, BufReader, Write},
    net::{self, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::{debug, info, warn};

use super::{
    ConnectionWriter, Dispatcher, FrameReader, ProtocolError, Subscription,
    transport::DEFAULT_MAX_CONTENT_LENGTH,
};
use crate::{storage::StorageFacade, tasks::Shutdown};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Serving,
    Closing,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Gateway address as `host:port`.
    pub address: String,
    pub subscription: Subscription,
    pub reconnect_delay: Duration,
    /// Bound on each connection attempt, so a shutdown is never stuck behind one.
    pub connect_timeout: Duration,
    pub max_content_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            subscription: Subscription::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

type SessionSlot = Arc<Mutex<Option<TcpStream>>>;

/// Keeps a single session with the gateway alive: connect, subscribe, serve
/// frames until the connection breaks, then reconnect after a fixed delay.
pub struct Supervisor<S: StorageFacade + ?Sized> {
    config: SupervisorConfig,
    storage: Arc<S>,
    shutdown: Shutdown,
    session: SessionSlot,
}

/// Stops a running [`Supervisor`] from another thread.
#[derive(Clone)]
pub struct SupervisorHandle {
    shutdown: Shutdown,
    session: SessionSlot,
}

impl SupervisorHandle {
    /// Stops reconnecting and shuts the live socket, if any, so a blocked read
    /// returns.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        if let Some(stream) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = stream.shutdown(net::Shutdown::Both);
        }
    }
}

impl<S: StorageFacade + ?Sized> Supervisor<S> {
    pub fn new(config: SupervisorConfig, storage: Arc<S>) -> Self {
        Self {
            config,
            storage,
            shutdown: Shutdown::new(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shutdown: self.shutdown.clone(),
            session: Arc::clone(&self.session),
        }
    }

    /// Runs sessions back to back until [`SupervisorHandle::shutdown`] is called.
    pub fn run(&self) {
        info!("bridging gateway at {}", self.config.address);
        let mut state = SessionState::Disconnected;

        while !self.shutdown.is_triggered() {
            transition(&mut state, SessionState::Connecting);
            let result = self.open_session(&mut state);

            transition(&mut state, SessionState::Closing);
            self.close_session();
            match result {
                Err(e) if !self.shutdown.is_triggered() => warn!("session ended: {e}"),
                _ => info!("session closed"),
            }
            transition(&mut state, SessionState::Disconnected);

            if self.shutdown.wait(self.config.reconnect_delay) {
                break;
            }
        }
        info!("supervisor stopped");
    }

    fn open_session(&self, state: &mut SessionState) -> Result<(), ProtocolError> {
        let stream = self.connect()?;
        info!("connected to {}", self.config.address);

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream.try_clone()?);
        if self.shutdown.is_triggered() {
            return Ok(());
        }

        transition(state, SessionState::Handshaking);
        let writer = ConnectionWriter::new(stream.try_clone()?);
        writer.send(&self.config.subscription.encode())?;

        transition(state, SessionState::Serving);
        let mut reader = FrameReader::new(BufReader::new(stream))
            .with_max_content_length(self.config.max_content_length);
        let dispatcher = Dispatcher::new(Arc::clone(&self.storage), writer);

        Err(serve(&mut reader, &dispatcher))
    }

    /// Tries every address the configured host resolves to, each bounded by the
    /// connect timeout.
    fn connect(&self) -> Result<TcpStream, ProtocolError> {
        let mut last_error = None;
        for addr in self.config.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("connecting to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' resolved to no addresses", self.config.address),
                )
            })
            .into())
    }

    fn close_session(&self) {
        let stream = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stream) = stream {
            let _ = stream.shutdown(net::Shutdown::Both);
        }
    }
}

/// Reads and dispatches frames in arrival order until reading fails, returning
/// the error that ended the session.
pub fn serve<R, S, W>(reader: &mut FrameReader<R>, dispatcher: &Dispatcher<S, W>) -> ProtocolError
where
    R: BufRead,
    S: StorageFacade + ?Sized,
    W: Write,
{
    loop {
        match reader.read_message() {
            Ok(msg) => {
                let outcome = dispatcher.handle(&msg);
                debug!("handled {msg}: {outcome:?}");
            }
            Err(e) => return e,
        }
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!("session {state:?} -> {next:?}");
    *state = next;
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Read},
        net::TcpListener,
        thread,
        time::Instant,
    };

    use super::*;
    use crate::{
        protocol::{
            Message, Method, Value,
            message::{HISTORY, RES_TABLE},
            table::encode,
        },
        storage::{HistoryStore, SensorStore, history::DEFAULT_RETENTION_SECS},
    };

    fn store() -> Arc<SensorStore> {
        Arc::new(SensorStore::new(HistoryStore::in_memory(
            &[103],
            DEFAULT_RETENTION_SECS,
        )))
    }

    #[test]
    fn serve_until_connection_closes() {
        let storage = store();
        let mut bytes = Message::push(RES_TABLE, encode(&[(103, Value::Int(5))])).encode();
        bytes.extend(Message::push(RES_TABLE, vec![1, 2, 3]).encode());
        bytes.extend(Message::push(RES_TABLE, encode(&[(7, Value::Float(1.0))])).encode());

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let dispatcher = Dispatcher::new(Arc::clone(&storage), ConnectionWriter::new(Vec::new()));

        let err = serve(&mut reader, &dispatcher);
        assert!(matches!(err, ProtocolError::ConnectionClosed));
        assert_eq!(storage.snapshot()[103], Some(Value::Int(5)));
        assert_eq!(storage.snapshot()[7], Some(Value::Float(1.0)));
    }

    #[test]
    fn serve_stops_at_syntax_error() {
        let storage = store();
        let mut bytes = b"HELLO\r\n".to_vec();
        bytes.extend(Message::push(RES_TABLE, encode(&[(103, Value::Int(5))])).encode());

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let dispatcher = Dispatcher::new(Arc::clone(&storage), ConnectionWriter::new(Vec::new()));

        assert!(matches!(
            serve(&mut reader, &dispatcher),
            ProtocolError::Syntax(_)
        ));
        assert_eq!(storage.snapshot()[103], None);
    }

    #[test]
    fn shutdown_is_prompt_while_connecting() {
        let supervisor = Supervisor::new(
            SupervisorConfig {
                // Non-routable, so attempts hang until the connect timeout.
                address: "10.255.255.1:9".to_string(),
                reconnect_delay: Duration::from_millis(10),
                connect_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            store(),
        );
        let handle = supervisor.handle();
        let runner = thread::spawn(move || supervisor.run());

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        handle.shutdown();
        runner.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn unresolvable_address_is_retried() {
        let supervisor = Supervisor::new(
            SupervisorConfig {
                address: "no port here".to_string(),
                reconnect_delay: Duration::from_millis(5),
                ..Default::default()
            },
            store(),
        );
        assert!(supervisor.connect().is_err());

        let handle = supervisor.handle();
        let runner = thread::spawn(move || supervisor.run());
        thread::sleep(Duration::from_millis(30));
        handle.shutdown();
        runner.join().unwrap();
    }

    #[test]
    fn reconnects_after_broken_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let storage = store();
        let supervisor = Supervisor::new(
            SupervisorConfig {
                address: listener.local_addr().unwrap().to_string(),
                reconnect_delay: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::clone(&storage),
        );
        let handle = supervisor.handle();
        let runner = thread::spawn(move || supervisor.run());

        // First session: a push followed by a malformed frame.
        let (mut conn, _) = listener.accept().unwrap();
        let mut handshake = [0; 41];
        conn.read_exact(&mut handshake).unwrap();
        assert_eq!(&handshake, b"PUSH res_table|GET history&py_miner,pm1\r\n");

        conn.write_all(&Message::push(RES_TABLE, encode(&[(103, Value::Int(5))])).encode())
            .unwrap();
        conn.write_all(b"BOGUS\r\n").unwrap();
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(storage.snapshot()[103], Some(Value::Int(5)));

        // Second session: the supervisor came back and answers history requests.
        let (mut conn, _) = listener.accept().unwrap();
        conn.read_exact(&mut handshake).unwrap();
        conn.write_all(b"GET history?103&client42\r\nGET history?9&client42\r\n")
            .unwrap();

        let mut reader = FrameReader::new(BufReader::new(conn.try_clone().unwrap()));
        let reply = reader.read_message().unwrap();
        assert_eq!(reply.method(), Method::Push);
        assert_eq!(reply.command(), HISTORY);
        assert_eq!(reply.params(), Some("103"));
        assert_eq!(reply.recipient_id(), Some("client42"));
        assert_eq!(reply.content(), Some(&b""[..]));

        handle.shutdown();
        runner.join().unwrap();

        // Untracked sensor 9 produced no reply before the socket closed.
        assert!(reader.read_message().is_err());
    }
}
