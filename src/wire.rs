//! JSON-lines protocol: one request object per line in, one response
//! object per line out. Notifications for listened runs are interleaved
//! with responses as they happen.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};
use crate::limits::{MAX_LISTENS_PER_CONNECTION, MAX_REQUEST_LINE_LEN};
use crate::model::*;
use crate::observability::{command_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CheckAvailability {
        from: Day,
        to: Day,
        species: Species,
        #[serde(default)]
        run_type: Option<RunType>,
        #[serde(default = "one")]
        run_count: u32,
    },
    Allocate(AllocateRequest),
    Vacancy {
        date: Day,
        species: Species,
        #[serde(default)]
        run_type: Option<RunType>,
    },
    VacancySeries {
        from: Day,
        to: Day,
        species: Species,
        #[serde(default)]
        run_type: Option<RunType>,
    },
    Occupancy {
        run: RunNo,
        date: Day,
    },
    BookingOccupancy {
        booking: BookingNo,
    },
    RunsOfType {
        species: Species,
        #[serde(default)]
        run_type: Option<RunType>,
    },
    RegisterBooking(Booking),
    RegisterPet(Pet),
    ExtendHorizon {
        until: Day,
    },
    Checkpoint,
    Listen {
        run: RunNo,
    },
    Unlisten {
        run: RunNo,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok { result: Value },
    Error { code: String, message: String },
    Notification { run: RunNo, event: Event },
}

impl Response {
    fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Response::Ok { result },
            Err(e) => Response::error("internal", e.to_string()),
        }
    }

    fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::error(e.code(), e.to_string())
    }
}

fn encode(resp: &Response) -> String {
    serde_json::to_string(resp).unwrap_or_else(|e| {
        json!({"type": "error", "code": "internal", "message": e.to_string()}).to_string()
    })
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
    }
}

/// Per-connection state: the forwarding task of every listened run.
struct Session {
    engine: Arc<Engine>,
    listens: HashMap<RunNo, JoinHandle<()>>,
    notify_tx: mpsc::Sender<Response>,
}

impl Session {
    async fn handle(&mut self, req: Request) -> Response {
        let engine = &self.engine;
        let result = match req {
            Request::CheckAvailability {
                from,
                to,
                species,
                run_type,
                run_count,
            } => engine
                .check_availability(from, to, species, run_type.unwrap_or(RunType::Standard), run_count)
                .await
                .map(|available| Response::ok(json!({ "available": available }))),
            Request::Allocate(req) => engine.allocate(req).await.map(Response::ok),
            Request::Vacancy {
                date,
                species,
                run_type,
            } => engine
                .vacancy(date, species, run_type.unwrap_or(RunType::Standard))
                .await
                .map(|vacant| Response::ok(json!({ "vacant": vacant }))),
            Request::VacancySeries {
                from,
                to,
                species,
                run_type,
            } => engine
                .vacancy_series(from, to, species, run_type.unwrap_or(RunType::Standard))
                .await
                .map(|series| {
                    let days: Vec<Value> = series
                        .into_iter()
                        .map(|(date, vacant)| json!({ "date": date, "vacant": vacant }))
                        .collect();
                    Response::ok(days)
                }),
            Request::Occupancy { run, date } => engine.occupancy(run, date).await.map(Response::ok),
            Request::BookingOccupancy { booking } => {
                engine.booking_occupancy(booking).await.map(Response::ok)
            }
            Request::RunsOfType { species, run_type } => Ok(Response::ok(
                engine
                    .runs_of_type(species, run_type.unwrap_or(RunType::Standard))
                    .await,
            )),
            Request::RegisterBooking(booking) => engine
                .register_booking(booking)
                .await
                .map(|()| Response::ok(Value::Null)),
            Request::RegisterPet(pet) => {
                engine.register_pet(pet);
                Ok(Response::ok(Value::Null))
            }
            Request::ExtendHorizon { until } => engine
                .extend_horizon(until)
                .await
                .map(|(from, to)| Response::ok(json!({ "from": from, "to": to }))),
            Request::Checkpoint => engine.checkpoint().await.map(|()| Response::ok(Value::Null)),
            Request::Listen { run } => self.listen(run).await,
            Request::Unlisten { run } => {
                let was = self.listens.remove(&run).map(|h| h.abort()).is_some();
                Ok(Response::ok(json!({ "unlistened": was })))
            }
        };
        result.unwrap_or_else(Response::from)
    }

    async fn listen(&mut self, run: RunNo) -> Result<Response, EngineError> {
        self.engine.run(run).await?;
        if self.listens.contains_key(&run) {
            return Ok(Response::ok(json!({ "listening": run })));
        }
        if self.listens.len() >= MAX_LISTENS_PER_CONNECTION {
            return Err(EngineError::LimitExceeded("too many listens on connection"));
        }
        let mut rx = self.engine.notify.subscribe(run);
        let tx = self.notify_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(Response::Notification { run, event }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("listener on run {run} lagged, {n} notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listens.insert(run, handle);
        Ok(Response::ok(json!({ "listening": run })))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.listens.drain() {
            handle.abort();
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_LEN));
    let (notify_tx, mut notify_rx) = mpsc::channel::<Response>(256);
    let mut session = Session {
        engine,
        listens: HashMap::new(),
        notify_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let resp = Response::error("bad_request", "request line too long");
                        framed.send(encode(&resp)).await.map_err(codec_err)?;
                        continue;
                    }
                    Some(Err(e)) => return Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let resp = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => {
                        let label = command_label(&req);
                        let started = Instant::now();
                        let resp = session.handle(req).await;
                        let status = match &resp {
                            Response::Error { .. } => "error",
                            _ => "ok",
                        };
                        metrics::counter!(REQUESTS_TOTAL, "command" => label, "status" => status).increment(1);
                        metrics::histogram!(REQUEST_DURATION_SECONDS, "command" => label)
                            .record(started.elapsed().as_secs_f64());
                        resp
                    }
                    Err(e) => {
                        debug!("unparseable request: {e}");
                        Response::error("bad_request", e.to_string())
                    }
                };
                framed.send(encode(&resp)).await.map_err(codec_err)?;
            }
            Some(note) = notify_rx.recv() => {
                framed.send(encode(&note)).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}
