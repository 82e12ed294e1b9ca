//! Drives a [`Script`] against an in-memory device and reports what the guest would observe.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use pvdisplay_backend::{
    CommandDispatcher, ConnectorId, DisplayDevice, DisplbackConfig, GrantTable,
    RecordingTransport, SoftwareBackend,
};
use pvdisplay_protocol::displif::{
    DisplCommand, DisplEventKind, DisplOpcode, DisplRequest, DISPLIF_RECORD_SIZE_BYTES,
    REQ_ID_OFFSET, REQ_OPERATION_OFFSET,
};
use pvdisplay_protocol::PAGE_SIZE;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::script::{Script, ScriptCommand, Step};

const MIN_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// One line of replay output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayLine {
    Response {
        connector: ConnectorId,
        id: u16,
        operation: String,
        status: i32,
    },
    Event {
        connector: ConnectorId,
        id: u16,
        event: &'static str,
        fb_cookie: u64,
    },
}

struct Connection {
    transport: Arc<RecordingTransport>,
    dispatcher: CommandDispatcher,
}

pub struct Replay {
    table: Arc<GrantTable>,
    backend: Arc<SoftwareBackend>,
    device: Arc<DisplayDevice>,
    connections: BTreeMap<ConnectorId, Connection>,
    auto_complete: bool,
    expected_events: usize,
    drained_events: usize,
    settle_timeout: Duration,
}

impl Replay {
    /// Build the device described by `script` and share its initial guest pages.
    pub fn new(script: &Script, config: DisplbackConfig) -> anyhow::Result<Self> {
        let table = Arc::new(GrantTable::new());
        for page in &script.pages {
            let mut contents = vec![page.fill; PAGE_SIZE];
            let len = page.bytes.len().min(PAGE_SIZE);
            contents[..len].copy_from_slice(&page.bytes[..len]);
            table.share_page(page.gref, &contents);
        }
        for chain in &script.directories {
            table.share_directory_chain(&chain.directory, &chain.data);
        }

        let backend = Arc::new(SoftwareBackend::new(script.backend.clone(), table.clone()));
        let settle_timeout = config.flip_timeout().max(MIN_SETTLE_TIMEOUT);
        let device =
            DisplayDevice::start(backend.clone(), config).context("starting display device")?;

        let mut connections = BTreeMap::new();
        for connector in &script.backend.connectors {
            let transport = Arc::new(RecordingTransport::new());
            let dispatcher =
                CommandDispatcher::new(&device, table.clone(), connector.id, transport.clone());
            connections.insert(
                connector.id,
                Connection {
                    transport,
                    dispatcher,
                },
            );
        }
        info!(
            connectors = connections.len(),
            pages = table.shared_pages(),
            "replay device ready"
        );

        Ok(Self {
            table,
            backend,
            device,
            connections,
            auto_complete: script.backend.auto_complete_flips,
            expected_events: 0,
            drained_events: 0,
            settle_timeout,
        })
    }

    pub fn backend(&self) -> &Arc<SoftwareBackend> {
        &self.backend
    }

    pub fn device(&self) -> &Arc<DisplayDevice> {
        &self.device
    }

    /// Run one step and return every response and event it produced.
    pub fn step(&mut self, step: &Step) -> anyhow::Result<Vec<ReplayLine>> {
        debug!(?step, "replaying step");
        match step {
            Step::Request {
                connector,
                id,
                command,
            } => self.request(*connector, *id, command)?,
            Step::WritePage {
                gref,
                offset,
                bytes,
            } => self
                .table
                .write(*gref, *offset, bytes)
                .with_context(|| format!("guest write to gref {gref}"))?,
            Step::CompleteFlips { engine } => {
                let completed = match engine {
                    Some(engine) => usize::from(self.backend.complete_flip(*engine)),
                    None => self.backend.complete_all_flips(),
                };
                debug!(completed, "signalled vblank");
                self.expected_events += completed;
            }
            Step::SetConnected {
                connector,
                connected,
            } => {
                if !self.backend.set_connected(*connector, *connected) {
                    bail!("unknown connector {connector}");
                }
            }
        }
        Ok(self.settle())
    }

    /// Tear every connection down and stop the device.
    pub fn finish(mut self) -> Vec<ReplayLine> {
        for connection in self.connections.values_mut() {
            connection.dispatcher.teardown();
        }
        self.device.stop();
        self.drain()
    }

    fn request(
        &mut self,
        connector: ConnectorId,
        id: u16,
        command: &ScriptCommand,
    ) -> anyhow::Result<()> {
        let Some(connection) = self.connections.get_mut(&connector) else {
            bail!("no connection for connector {connector}");
        };
        let decoded = command.to_command()?;
        let record = match (decoded, command) {
            (Some(command), _) => DisplRequest { id, command }.encode_to_le_bytes(),
            (None, ScriptCommand::Raw { operation }) => {
                let mut record = [0u8; DISPLIF_RECORD_SIZE_BYTES];
                record[REQ_ID_OFFSET..REQ_ID_OFFSET + 2].copy_from_slice(&id.to_le_bytes());
                record[REQ_OPERATION_OFFSET] = *operation;
                record
            }
            (None, _) => bail!("command {command:?} has no wire form"),
        };

        let response = connection.dispatcher.process_request(&record);
        let flipped = matches!(decoded, Some(DisplCommand::PgFlip(_)))
            && response.is_some_and(|r| r.status == 0);
        if flipped && self.auto_complete {
            self.expected_events += 1;
        }
        Ok(())
    }

    fn delivered_events(&self) -> usize {
        self.drained_events
            + self
                .connections
                .values()
                .map(|c| c.transport.events().len())
                .sum::<usize>()
    }

    /// Wait for completions the backend has already signalled to reach their transports.
    fn settle(&mut self) -> Vec<ReplayLine> {
        let deadline = Instant::now() + self.settle_timeout;
        while self.delivered_events() < self.expected_events {
            if Instant::now() >= deadline {
                warn!(
                    expected = self.expected_events,
                    delivered = self.delivered_events(),
                    "timed out waiting for flip events"
                );
                self.expected_events = self.delivered_events();
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.drain()
    }

    fn drain(&mut self) -> Vec<ReplayLine> {
        let mut lines = Vec::new();
        let mut events = 0;
        for (connector, connection) in &self.connections {
            for response in connection.transport.take_responses() {
                lines.push(ReplayLine::Response {
                    connector: *connector,
                    id: response.id,
                    operation: operation_name(response.operation),
                    status: response.status,
                });
            }
            for event in connection.transport.take_events() {
                events += 1;
                let DisplEventKind::PgFlip { fb_cookie } = event.kind;
                lines.push(ReplayLine::Event {
                    connector: *connector,
                    id: event.id,
                    event: "PG_FLIP",
                    fb_cookie,
                });
            }
        }
        self.drained_events += events;
        lines
    }
}

fn operation_name(operation: u8) -> String {
    DisplOpcode::from_u8(operation)
        .map(|op| op.name().to_string())
        .unwrap_or_else(|| format!("0x{operation:02x}"))
}

/// Replay `script` and write one JSON object per line to `out`.
pub fn run(script: &Script, config: DisplbackConfig, mut out: impl Write) -> anyhow::Result<()> {
    let mut replay = Replay::new(script, config)?;
    for (index, step) in script.steps.iter().enumerate() {
        let lines = replay
            .step(step)
            .with_context(|| format!("step {index}"))?;
        write_lines(&mut out, &lines)?;
    }
    write_lines(&mut out, &replay.finish())?;
    out.flush()?;
    Ok(())
}

fn write_lines(out: &mut impl Write, lines: &[ReplayLine]) -> anyhow::Result<()> {
    for line in lines {
        serde_json::to_writer(&mut *out, line)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}
