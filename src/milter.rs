use crate::headers::header_section_end;
use crate::pipeline::MessageFilter;
use indymilter::{run, Actions, Callbacks, Config as IndyConfig, ContextActions, Status};
use std::sync::Arc;
use tokio::net::UnixListener;

/// Milter front end feeding each message through a [`MessageFilter`].
///
/// The MTA keeps its own copy of the message, so results are carried back
/// as added header fields only.
pub struct Milter {
    filter: Arc<dyn MessageFilter>,
}

/// Per-connection state kept in the milter context.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub client: String,
    pub sender: String,
    pub raw: Vec<u8>,
}

impl ConnectionState {
    fn start_message(&mut self, sender: String) {
        self.sender = sender;
        self.raw.clear();
    }

    fn push_header(&mut self, name: &[u8], value: &[u8]) {
        self.raw.extend_from_slice(name);
        self.raw.extend_from_slice(b": ");
        self.raw.extend_from_slice(value);
        self.raw.push(b'\n');
    }

    fn end_of_headers(&mut self) {
        self.raw.push(b'\n');
    }

    fn push_body(&mut self, chunk: &[u8]) {
        self.raw.extend_from_slice(chunk);
    }

    fn abort(&mut self) {
        self.sender.clear();
        self.raw.clear();
    }
}

/// Unfolded `(name, value)` pairs of the header section.
pub fn header_fields(message: &[u8]) -> Vec<(String, String)> {
    let section = &message[..header_section_end(message)];
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in section.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(line);
        if line[0] == b' ' || line[0] == b'\t' {
            if let Some((_, value)) = fields.last_mut() {
                value.push_str(&text);
            }
            continue;
        }
        if let Some((name, value)) = text.split_once(':') {
            fields.push((name.to_string(), value.trim_start().to_string()));
        }
    }
    fields
}

/// Fields of `rewritten` that do not appear in `original`, in order.
pub fn added_fields(
    original: &[(String, String)],
    rewritten: &[(String, String)],
) -> Vec<(String, String)> {
    let mut remaining: Vec<&(String, String)> = original.iter().collect();
    let mut added = Vec::new();
    for field in rewritten {
        match remaining.iter().position(|f| *f == field) {
            Some(i) => {
                remaining.remove(i);
            }
            None => added.push(field.clone()),
        }
    }
    added
}

impl Milter {
    pub fn new(filter: Arc<dyn MessageFilter>) -> Self {
        Milter { filter }
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {}", socket_path);
        // Remove existing socket if it exists
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        let filter = self.filter.clone();

        let callbacks: Callbacks<ConnectionState> = Callbacks {
            connect: Some(Box::new(
                move |ctx: &mut indymilter::Context<ConnectionState>, hostname, _addr| {
                    Box::pin(async move {
                        let client = hostname.to_string_lossy().to_string();
                        log::debug!("Connection from: {}", client);
                        ctx.data = Some(ConnectionState {
                            client,
                            ..Default::default()
                        });
                        Status::Continue
                    })
                },
            )),

            mail: Some(Box::new(
                move |ctx: &mut indymilter::Context<ConnectionState>, sender| {
                    Box::pin(async move {
                        let sender_str = sender
                            .iter()
                            .map(|s| s.to_string_lossy())
                            .collect::<Vec<_>>()
                            .join(",");
                        log::debug!("Mail from: {}", sender_str);
                        ctx.data
                            .get_or_insert_with(Default::default)
                            .start_message(sender_str);
                        Status::Continue
                    })
                },
            )),

            header: Some(Box::new(
                move |ctx: &mut indymilter::Context<ConnectionState>, name, value| {
                    Box::pin(async move {
                        if let Some(state) = ctx.data.as_mut() {
                            state.push_header(name.as_bytes(), value.as_bytes());
                        }
                        Status::Continue
                    })
                },
            )),

            eoh: Some(Box::new(
                move |ctx: &mut indymilter::Context<ConnectionState>| {
                    Box::pin(async move {
                        if let Some(state) = ctx.data.as_mut() {
                            state.end_of_headers();
                        }
                        Status::Continue
                    })
                },
            )),

            body: Some(Box::new(
                move |ctx: &mut indymilter::Context<ConnectionState>, body_chunk| {
                    Box::pin(async move {
                        if let Some(state) = ctx.data.as_mut() {
                            state.push_body(&body_chunk);
                        }
                        Status::Continue
                    })
                },
            )),

            eom: Some(Box::new(
                move |ctx: &mut indymilter::EomContext<ConnectionState>| {
                    let filter = filter.clone();
                    Box::pin(async move {
                        let Some(state) = ctx.data.as_mut() else {
                            return Status::Accept;
                        };
                        let raw = std::mem::take(&mut state.raw);
                        log::info!(
                            "End of message - filtering. FROM={}, REMOTE={}, BYTES={}",
                            state.sender,
                            state.client,
                            raw.len()
                        );

                        let original = header_fields(&raw);
                        let rewritten = filter.process(raw).await;
                        for (name, value) in added_fields(&original, &header_fields(&rewritten)) {
                            log::debug!("Adding header {}: {}", name, value);
                            if let Err(e) = ctx.actions.add_header(name, value).await {
                                log::error!("Failed to add header: {}", e);
                            }
                        }
                        Status::Accept
                    })
                },
            )),

            abort: Some(Box::new(
                move |ctx: &mut indymilter::Context<ConnectionState>| {
                    Box::pin(async move {
                        if let Some(state) = ctx.data.as_mut() {
                            state.abort();
                        }
                        Status::Continue
                    })
                },
            )),

            ..Default::default()
        };

        let config = IndyConfig {
            actions: Actions::ADD_HEADER,
            ..Default::default()
        };

        run(listener, callbacks, config, tokio::signal::ctrl_c()).await?;
        Ok(())
    }
}
