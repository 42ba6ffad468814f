use crate::agent::{ ChatAgent, TurnEvent };
use crate::cli::Args;
use crate::models::chat::ChatRequest;
use crate::models::websocket::ServerMessage;

use std::collections::VecDeque;
use std::error::Error;
use std::fmt::Display;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{ certs, private_key };

use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;

use futures::{ Sink, SinkExt, Stream, StreamExt };
use log::{ error, info, warn };

pub const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;
/// Frames a client may queue while a turn is still running.
pub const MAX_PENDING_FRAMES: usize = 16;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = private_key(&mut key_reader)
        .map_err(|e| format!("Error reading private key: {}", e))?
        .ok_or("No private key found in key file")?;

    let config = ServerConfig::builder_with_provider(
        Arc::new(rustls::crypto::ring::default_provider())
    )
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    agent: Arc<ChatAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.server_addr.as_str();
    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    let listener = TcpListener::bind(addr).await?;
    let protocol = if tls_acceptor.is_some() { "wss" } else { "ws" };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let agent_clone = Arc::clone(&agent);
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, agent_clone).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, agent_clone).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    agent: Arc<ChatAgent>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let websocket = accept_async(stream).await?;
    info!("New WebSocket connection: {}", peer);

    let (outbound, inbound) = websocket.split();
    run_session(peer.to_string(), agent, inbound, outbound).await;

    info!("WebSocket connection closed: {}", peer);
    Ok(())
}

enum TurnEnd {
    Completed(Option<String>),
    Disconnected,
}

/// Serves chat turns on one connection until the client leaves.
///
/// Each text frame is a `ChatRequest`. A turn's chunks are forwarded as they
/// arrive and followed by a `done` frame. Bad requests get an `error` frame
/// and the session carries on. While a turn runs, pings are answered and
/// other frames wait their turn; a close cancels the running turn.
pub async fn run_session<I, O>(peer: String, agent: Arc<ChatAgent>, mut inbound: I, mut outbound: O)
    where
        I: Stream<Item = Result<Message, WsError>> + Unpin + Send,
        O: Sink<Message> + Unpin + Send,
        O::Error: Display
{
    let mut pending: VecDeque<Message> = VecDeque::new();

    loop {
        let message = match pending.pop_front() {
            Some(message) => message,
            None =>
                match inbound.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    None => {
                        break;
                    }
                }
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        text.len(),
                        MAX_MESSAGE_SIZE
                    );
                    if !send_error(&peer, &mut outbound, "Message too large").await {
                        break;
                    }
                    continue;
                }

                let request = match serde_json::from_str::<ChatRequest>(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Invalid chat request from {}: {}", peer, e);
                        let message = format!("Invalid chat request: {}", e);
                        if !send_error(&peer, &mut outbound, &message).await {
                            break;
                        }
                        continue;
                    }
                };

                match run_turn(&peer, &agent, request, &mut inbound, &mut outbound, &mut pending).await {
                    TurnEnd::Completed(conversation_id) => {
                        let done = ServerMessage::Done { conversation_id }.to_json();
                        if !send_frame(&peer, &mut outbound, Message::Text(done)).await {
                            break;
                        }
                    }
                    TurnEnd::Disconnected => {
                        break;
                    }
                }
            }
            Message::Binary(_) => {
                if !send_error(&peer, &mut outbound, "Binary frames are not supported").await {
                    break;
                }
            }
            Message::Ping(payload) => {
                if !send_frame(&peer, &mut outbound, Message::Pong(payload)).await {
                    break;
                }
            }
            Message::Close(_) => {
                break;
            }
            _ => {}
        }
    }
}

async fn run_turn<I, O>(
    peer: &str,
    agent: &Arc<ChatAgent>,
    request: ChatRequest,
    inbound: &mut I,
    outbound: &mut O,
    pending: &mut VecDeque<Message>
) -> TurnEnd
    where
        I: Stream<Item = Result<Message, WsError>> + Unpin + Send,
        O: Sink<Message> + Unpin + Send,
        O::Error: Display
{
    let conversation_id = request.conversation().map(str::to_string);

    let mut turn = match agent.stream_chat(request) {
        Ok(turn) => turn,
        Err(e) => {
            if !send_error(peer, outbound, &e.to_string()).await {
                return TurnEnd::Disconnected;
            }
            return TurnEnd::Completed(conversation_id);
        }
    };

    loop {
        tokio::select! {
            event = turn.next() => {
                let frame = match event {
                    Some(TurnEvent::Chunk(chunk)) => chunk,
                    Some(TurnEvent::Status(status)) => ServerMessage::Status(status).to_json(),
                    None => return TurnEnd::Completed(conversation_id),
                };
                if !send_frame(peer, outbound, Message::Text(frame)).await {
                    return TurnEnd::Disconnected;
                }
            }
            incoming = inbound.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if !send_frame(peer, outbound, Message::Pong(payload)).await {
                            return TurnEnd::Disconnected;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        info!("{} disconnected mid-turn, cancelling generation", peer);
                        return TurnEnd::Disconnected;
                    }
                    Some(Ok(other)) if pending.len() < MAX_PENDING_FRAMES => pending.push_back(other),
                    Some(Ok(_)) => {
                        warn!("{} queued more than {} frames mid-turn, dropping one", peer, MAX_PENDING_FRAMES);
                        if !send_error(peer, outbound, "Too many queued requests, message dropped").await {
                            return TurnEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }
}

async fn send_error<O>(peer: &str, outbound: &mut O, message: &str) -> bool
    where O: Sink<Message> + Unpin, O::Error: Display
{
    let frame = ServerMessage::Error { message: message.to_string() }.to_json();
    send_frame(peer, outbound, Message::Text(frame)).await
}

async fn send_frame<O>(peer: &str, outbound: &mut O, frame: Message) -> bool
    where O: Sink<Message> + Unpin, O::Error: Display
{
    match outbound.send(frame).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to send to {}: {}", peer, e);
            false
        }
    }
}
