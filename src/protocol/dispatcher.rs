use std::{io::Write, sync::Arc};

use log::{debug, info, warn};
use thiserror::Error;

use super::{
    ConnectionWriter, Message, Method, ProtocolError, SensorId,
    message::{HISTORY, RES_TABLE},
    table::{self, TableError},
};
use crate::storage::{StorageFacade, Timestamp, now_secs, sensor_name};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Start of the history window for a request made at `now`: midnight (UTC) at the
/// beginning of the previous day.
pub fn history_since(now: Timestamp) -> Timestamp {
    (now / SECS_PER_DAY).saturating_sub(1) * SECS_PER_DAY
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unrecognized message: {0}")]
    Unrecognized(String),
    #[error("malformed sensor table: {0}")]
    Table(#[from] TableError),
    #[error("invalid sensor id '{0}'")]
    InvalidSensorId(String),
    #[error("failed to send reply: {0}")]
    Reply(#[from] ProtocolError),
}

/// What handling a single message amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A pushed table was decoded and this many readings were stored.
    Stored(usize),
    /// A history reply was written back.
    Replied,
    /// The requested sensor has no history, nothing was written.
    NoHistory,
    /// The message could not be handled and was discarded.
    Dropped,
}

/// Routes decoded messages to storage and writes replies.
pub struct Dispatcher<S: StorageFacade + ?Sized, W: Write> {
    storage: Arc<S>,
    writer: ConnectionWriter<W>,
    clock: fn() -> Timestamp,
}

impl<S: StorageFacade + ?Sized, W: Write> Dispatcher<S, W> {
    pub fn new(storage: Arc<S>, writer: ConnectionWriter<W>) -> Self {
        Self {
            storage,
            writer,
            clock: now_secs,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    /// Handles one message. Errors are logged and never leave this call, so the
    /// read loop always moves on to the next frame.
    pub fn handle(&self, msg: &Message) -> Outcome {
        match self.route(msg) {
            Ok(outcome) => outcome,
            Err(e @ DispatchError::Unrecognized(_)) => {
                warn!("{e}");
                Outcome::Dropped
            }
            Err(e) => {
                warn!("dropping message ({msg}): {e}");
                Outcome::Dropped
            }
        }
    }

    fn route(&self, msg: &Message) -> Result<Outcome, DispatchError> {
        match (msg.method(), msg.command()) {
            (Method::Push, RES_TABLE) => self.store_table(msg.content().unwrap_or_default()),
            (Method::Get, HISTORY) => match (msg.params(), msg.recipient_id()) {
                (Some(params), Some(recipient_id)) => self.reply_history(params, recipient_id),
                _ => Err(DispatchError::Unrecognized(msg.to_string())),
            },
            _ => Err(DispatchError::Unrecognized(msg.to_string())),
        }
    }

    fn store_table(&self, content: &[u8]) -> Result<Outcome, DispatchError> {
        let readings = table::decode(content)?;
        debug!("storing {} readings", readings.len());

        for (sensor_id, value) in readings.iter() {
            self.storage.store(*sensor_id, *value);
        }
        Ok(Outcome::Stored(readings.len()))
    }

    fn reply_history(&self, params: &str, recipient_id: &str) -> Result<Outcome, DispatchError> {
        let sensor_id = params
            .trim()
            .parse::<SensorId>()
            .map_err(|_| DispatchError::InvalidSensorId(params.to_string()))?;
        info!(
            "fetching history of sensor {sensor_id} ({}) for {recipient_id}",
            sensor_name(sensor_id).unwrap_or("unnamed")
        );

        let since = history_since((self.clock)());
        let Some(entries) = self.storage.query_history(sensor_id, since) else {
            info!("sensor {sensor_id} has no history, ignoring request");
            return Ok(Outcome::NoHistory);
        };

        let payload = entries
            .iter()
            .map(|(ts, value)| format!("{ts},{value}"))
            .collect::<Vec<_>>()
            .join(",");
        let reply = Message::push(HISTORY, payload.into_bytes())
            .with_params(sensor_id.to_string())
            .with_recipient(recipient_id);

        self.writer.send_message(&reply)?;
        debug!("sent {} history entries to {recipient_id}", entries.len());
        Ok(Outcome::Replied)
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex};

    use super::*;
    use crate::protocol::{Value, table::encode};

    const NOW: Timestamp = 1_397_900_000;

    #[derive(Default)]
    struct Recorder {
        stored: Mutex<Vec<(SensorId, Value)>>,
        queries: Mutex<Vec<(SensorId, Timestamp)>>,
    }

    impl StorageFacade for Recorder {
        fn store(&self, sensor_id: SensorId, value: Value) {
            self.stored.lock().unwrap().push((sensor_id, value));
        }

        fn query_history(
            &self,
            sensor_id: SensorId,
            since: Timestamp,
        ) -> Option<Vec<(Timestamp, Value)>> {
            self.queries.lock().unwrap().push((sensor_id, since));
            match sensor_id {
                103 => Some(vec![
                    (1397826993, Value::Int(1)),
                    (1397827093, Value::Int(2)),
                ]),
                104 => Some(vec![]),
                _ => None,
            }
        }

        fn snapshot(&self) -> Vec<Option<Value>> {
            vec![None; 256]
        }
    }

    /// Write end whose bytes stay inspectable after the dispatcher takes it.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn dispatcher() -> (Arc<Recorder>, Dispatcher<Recorder, Sink>, Sink) {
        let storage = Arc::new(Recorder::default());
        let sink = Sink::default();
        let dispatcher = Dispatcher::new(Arc::clone(&storage), ConnectionWriter::new(sink.clone()))
            .with_clock(|| NOW);
        (storage, dispatcher, sink)
    }

    fn written(sink: &Sink) -> Vec<u8> {
        sink.0.lock().unwrap().clone()
    }

    #[test]
    fn history_window_starts_at_previous_midnight() {
        // 2014-04-19 09:33:20 UTC
        assert_eq!(history_since(NOW), 1_397_779_200);
        assert_eq!(history_since(1_397_865_600), 1_397_779_200);
        assert_eq!(history_since(1_397_865_599), 1_397_692_800);
        assert_eq!(history_since(3_600), 0);
    }

    #[test]
    fn push_table_is_stored_in_order() {
        let (storage, dispatcher, writer) = dispatcher();
        let table = encode(&[(103, Value::Int(5)), (104, Value::Float(1.0))]);

        let outcome = dispatcher.handle(&Message::push(RES_TABLE, table));
        assert_eq!(outcome, Outcome::Stored(2));
        assert_eq!(
            *storage.stored.lock().unwrap(),
            vec![(103, Value::Int(5)), (104, Value::Float(1.0))]
        );
        assert!(written(&writer).is_empty());
    }

    #[test]
    fn malformed_table_is_dropped() {
        let (storage, dispatcher, _) = dispatcher();

        let outcome = dispatcher.handle(&Message::push(RES_TABLE, vec![0x67, 0x00, 0x05]));
        assert_eq!(outcome, Outcome::Dropped);
        assert!(storage.stored.lock().unwrap().is_empty());
    }

    #[test]
    fn history_request_is_answered() {
        let (storage, dispatcher, writer) = dispatcher();
        let request = Message::get(HISTORY)
            .with_params("103")
            .with_recipient("client42");

        assert_eq!(dispatcher.handle(&request), Outcome::Replied);
        assert_eq!(
            written(&writer),
            b"PUSH history?103&client42\r\nLength=25\r\n1397826993,1,1397827093,2\r\n".to_vec()
        );
        assert_eq!(
            *storage.queries.lock().unwrap(),
            vec![(103, 1_397_779_200)]
        );
    }

    #[test]
    fn empty_history_is_answered_with_empty_body() {
        let (_, dispatcher, writer) = dispatcher();
        let request = Message::get(HISTORY).with_params("104").with_recipient("c");

        assert_eq!(dispatcher.handle(&request), Outcome::Replied);
        assert_eq!(
            written(&writer),
            b"PUSH history?104&c\r\nLength=0\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn untracked_sensor_gets_no_reply() {
        let (_, dispatcher, writer) = dispatcher();
        let request = Message::get(HISTORY).with_params("42").with_recipient("c");

        assert_eq!(dispatcher.handle(&request), Outcome::NoHistory);
        assert!(written(&writer).is_empty());
    }

    #[test]
    fn invalid_sensor_id_is_dropped() {
        let (storage, dispatcher, writer) = dispatcher();
        for params in ["abc", "-1", "256", ""] {
            let request = Message::get(HISTORY).with_params(params).with_recipient("c");
            assert_eq!(dispatcher.handle(&request), Outcome::Dropped);
        }
        assert!(storage.queries.lock().unwrap().is_empty());
        assert!(written(&writer).is_empty());
    }

    #[test]
    fn unrecognized_messages_are_dropped() {
        let (storage, dispatcher, writer) = dispatcher();
        let messages = [
            Message::get(HISTORY).with_params("103"),
            Message::get(HISTORY).with_recipient("c"),
            Message::get(RES_TABLE),
            Message::post(RES_TABLE, encode(&[(1, Value::Int(1))])),
            Message::push("prediction", vec![]),
        ];

        for msg in messages.iter() {
            assert_eq!(dispatcher.handle(msg), Outcome::Dropped);
        }
        assert!(storage.stored.lock().unwrap().is_empty());
        assert!(written(&writer).is_empty());
    }
}
