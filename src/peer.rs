//! WebRTC peer runtime
//!
//! Connects to the signaling relay, runs a [`PeerSession`] over a `str0m`
//! engine and drives the engine from a UDP socket. Everything happens on one
//! task, so every signal reaches the session strictly in arrival order:
//!
//! 1. Join the room, and as offerer create and send the offer
//! 2. Trickle the local host candidates
//! 3. Loop over signaling frames, UDP datagrams, engine timeouts and the probe
//!    timer until the session closes
//!
//! Once the data channel opens the offerer sends a [`Probe`] every second and
//! the answerer echoes it, which gives the console a live round-trip figure.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use str0m::{
    channel::ChannelId,
    net::{Protocol, Receive},
    Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::{net::UdpSocket, sync::mpsc, sync::watch, time::interval};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};

use crate::{
    config::{PeerArgs, PeerRole},
    engine::{MediaEngine, Str0mEngine},
    model::{
        message::{self, Signal},
        probe::Probe,
    },
    session::{PeerSession, SessionError, SessionState},
    util::{host_candidates, select_host_address},
};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(args: PeerArgs) -> Result<()> {
    let (ws, _) = connect_async(args.signaling.as_str())
        .await
        .with_context(|| format!("connecting to signaling server {}", args.signaling))?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    info!("Connected to signaling server {}", args.signaling);

    let host = select_host_address()?;
    let socket = UdpSocket::bind(SocketAddr::new(host, 0))
        .await
        .context("binding UDP socket")?;
    let local = socket.local_addr()?;
    info!("Bound UDP port: {}", local);

    let mut engine = Str0mEngine::new(Rtc::builder().build(), args.channel.clone());
    let candidates: Vec<_> = host_candidates(local, &args.candidate_ips)
        .into_iter()
        .filter_map(|candidate| engine.add_local_candidate(candidate))
        .collect();
    if candidates.is_empty() {
        bail!("No ICE candidates were found");
    }

    let (outbox, mut outgoing) = mpsc::unbounded_channel::<Signal>();
    let mut session = PeerSession::new(engine, outbox);
    log_state_changes(session.subscribe());

    match args.role {
        PeerRole::Offerer => session.start(&args.room)?,
        PeerRole::Answerer => {
            session.join(&args.room)?;
            info!("Waiting for an offer in room '{}'", args.room);
        }
    }
    for candidate in candidates {
        session.on_local_candidate(candidate)?;
    }

    let mut link = Link::new(args.role);
    let mut buf = vec![0; 2000];
    let mut probes = interval(PROBE_INTERVAL);

    loop {
        while let Ok(signal) = outgoing.try_recv() {
            let text = signal.to_json()?;
            if let Err(e) = ws_tx.send(Message::text(text)).await {
                warn!("Signaling send failed: {}", e);
                session.on_transport_closed();
                break;
            }
        }

        if session.state() == SessionState::Closed {
            break;
        }

        let deadline = link.poll(&mut session, &socket);
        // The engine wants a strictly positive wait.
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        tokio::select! {
            frame = ws_rx.next() => handle_frame(&mut session, frame)?,
            received = socket.recv_from(&mut buf) => {
                let (n, source) = received.context("reading UDP socket")?;
                link.receive(&mut session, source, local, &buf[..n]);
            }
            _ = tokio::time::sleep(wait) => link.timeout(&mut session),
            _ = probes.tick() => link.send_probe(&mut session),
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    info!("Peer session closed");
    Ok(())
}

/// Feed one item read from the signaling websocket into the session.
///
/// The end of the stream, a close frame or a read error means the relay is
/// gone and closes the session. Only a failed negotiation is returned as an
/// error.
pub fn handle_frame<E: MediaEngine>(
    session: &mut PeerSession<E>,
    frame: Option<Result<Message, WsError>>,
) -> Result<()> {
    match frame {
        Some(Ok(Message::Text(text))) => handle_signal(session, text.as_str()),
        Some(Ok(Message::Close(_))) | None => {
            info!("Signaling connection closed");
            session.on_transport_closed();
            Ok(())
        }
        Some(Err(e)) => {
            warn!("Signaling connection failed: {}", e);
            session.on_transport_closed();
            Ok(())
        }
        Some(Ok(_)) => Ok(()),
    }
}

fn handle_signal<E: MediaEngine>(session: &mut PeerSession<E>, raw: &str) -> Result<()> {
    let signal = match message::decode(raw) {
        Ok(Some(signal)) => signal,
        Ok(None) => {
            debug!("Ignoring unknown signaling message");
            return Ok(());
        }
        Err(e) => {
            debug!("Dropping signaling frame: {}", e);
            return Ok(());
        }
    };

    info!("📨 Received '{}'", signal.kind());
    match session.on_message(signal) {
        Ok(()) | Err(SessionError::TransportClosed) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("negotiation failed")),
    }
}

fn log_state_changes(mut states: watch::Receiver<SessionState>) {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!("Session state: {:?}", state);
        }
    });
}

/// Media-side state of the peer: which data channel is open and the probe
/// sequence.
struct Link {
    role: PeerRole,
    channel: Option<ChannelId>,
    seq: u64,
}

impl Link {
    fn new(role: PeerRole) -> Self {
        Self {
            role,
            channel: None,
            seq: 0,
        }
    }

    /// Drain engine output until it asks to be woken at a later instant.
    fn poll(&mut self, session: &mut PeerSession<Str0mEngine>, socket: &UdpSocket) -> Instant {
        loop {
            let rtc = session.engine_mut().rtc_mut();
            if !rtc.is_alive() {
                return Instant::now() + PROBE_INTERVAL;
            }

            let output = match rtc.poll_output() {
                Ok(output) => output,
                Err(e) => {
                    warn!("Media engine failed: {:?}", e);
                    session.teardown();
                    return Instant::now();
                }
            };

            match output {
                Output::Timeout(t) => return t,
                Output::Transmit(transmit) => {
                    if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                        debug!("Dropping datagram to {}: {}", transmit.destination, e);
                    }
                }
                Output::Event(event) => self.handle_event(session, event),
            }
        }
    }

    fn handle_event(&mut self, session: &mut PeerSession<Str0mEngine>, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("🔌 ICE Connection State: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    session.teardown();
                }
            }
            Event::ChannelOpen(id, label) => {
                info!("🎉 Channel '{}' opened ({:?})", label, id);
                self.channel = Some(id);
            }
            Event::ChannelData(data) => self.handle_probe(session, data.id, &data.data),
            other => debug!("Event: {:?}", other),
        }
    }

    fn handle_probe(&mut self, session: &mut PeerSession<Str0mEngine>, id: ChannelId, data: &[u8]) {
        let probe = match Probe::decode(data) {
            Ok(probe) => probe,
            Err(e) => {
                debug!("Ignoring {} bytes on channel {:?}: {}", data.len(), id, e);
                return;
            }
        };

        match self.role {
            PeerRole::Offerer => info!(
                "📥 Probe #{} round trip {} ms",
                probe.seq,
                probe.elapsed().num_milliseconds()
            ),
            PeerRole::Answerer => {
                debug!(
                    "Probe #{} sent at {} arrived after {} ms",
                    probe.seq,
                    probe.sent_at(),
                    probe.elapsed().num_milliseconds()
                );
                write_channel(session, id, data);
            }
        }
    }

    fn send_probe(&mut self, session: &mut PeerSession<Str0mEngine>) {
        let (PeerRole::Offerer, Some(id)) = (self.role, self.channel) else {
            return;
        };

        self.seq += 1;
        match Probe::new(self.seq).encode() {
            Ok(bytes) => write_channel(session, id, &bytes),
            Err(e) => warn!("Could not encode probe: {}", e),
        }
    }

    fn receive(
        &mut self,
        session: &mut PeerSession<Str0mEngine>,
        source: SocketAddr,
        destination: SocketAddr,
        data: &[u8],
    ) {
        // Parse data to a DatagramRecv, which helps preparse network data to
        // figure out the multiplexing of all protocols on one UDP port.
        let Ok(contents) = data.try_into() else {
            debug!("Ignoring unrecognised datagram from {}", source);
            return;
        };

        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination,
                contents,
            },
        );
        drive(session, input);
    }

    fn timeout(&mut self, session: &mut PeerSession<Str0mEngine>) {
        drive(session, Input::Timeout(Instant::now()));
    }
}

fn drive(session: &mut PeerSession<Str0mEngine>, input: Input) {
    let rtc = session.engine_mut().rtc_mut();
    if !rtc.is_alive() {
        return;
    }

    if let Err(e) = rtc.handle_input(input) {
        warn!("Media engine disconnected: {:?}", e);
        session.teardown();
    }
}

fn write_channel(session: &mut PeerSession<Str0mEngine>, id: ChannelId, data: &[u8]) {
    let Some(mut channel) = session.engine_mut().rtc_mut().channel(id) else {
        return;
    };

    if let Err(e) = channel.write(true, data) {
        warn!("Data channel write failed: {:?}", e);
    }
}
