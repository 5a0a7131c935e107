//! Multiplexes one [`ObjectLink`] into independent sub-links.
//!
//! Roles are asymmetric: the **connector** side opens sub-links, the
//! **listener** side accepts them. Each side numbers sub-links from its own
//! counter; the counters stay in lockstep because only the connector opens,
//! so an id names the same sub-link on both ends. Sub-links implement
//! [`ObjectLink`] themselves, which is what lets the fabric stack four
//! multiplexer tiers on a single TCP stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proto::link::{Frame, ObjectLink, Payload};

enum SubMsg {
    Data(Payload),
    Eof,
}

struct MuxState {
    next_id: i64,
    // Capacity-1 ingress per sub-link: a slow consumer stalls only the
    // frames addressed to it.
    inboxes: HashMap<i64, mpsc::Sender<SubMsg>>,
}

struct MuxCore {
    link: Arc<dyn ObjectLink>,
    state: StdMutex<MuxState>,
    done: CancellationToken,
    first_err: StdMutex<Option<String>>,
}

impl MuxCore {
    fn latch(&self, reason: &str) {
        let mut err = self.first_err.lock().unwrap();
        if err.is_none() {
            *err = Some(reason.to_string());
        }
    }

    fn latched(&self) -> Error {
        let err = self.first_err.lock().unwrap();
        Error::LinkDead(
            err.clone()
                .unwrap_or_else(|| "multiplexer closed".to_string()),
        )
    }

    fn allocate(self: &Arc<Self>) -> (i64, mpsc::Receiver<SubMsg>) {
        let (tx, rx) = mpsc::channel(1);
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.inboxes.insert(id, tx);
        (id, rx)
    }

    async fn shutdown(&self, reason: &str) {
        self.latch(reason);
        if !self.done.is_cancelled() {
            self.done.cancel();
            let _ = self.link.close().await;
        }
    }
}

/// A demultiplexed object stream over one underlying link.
pub struct Multiplexer {
    core: Arc<MuxCore>,
    accepts: Option<Mutex<mpsc::Receiver<SubLink>>>,
}

impl Multiplexer {
    /// The side that opens sub-links.
    pub fn connector(link: Arc<dyn ObjectLink>) -> Self {
        Self::start(link, false)
    }

    /// The side that accepts sub-links.
    pub fn listener(link: Arc<dyn ObjectLink>) -> Self {
        Self::start(link, true)
    }

    fn start(link: Arc<dyn ObjectLink>, accepts: bool) -> Self {
        let core = Arc::new(MuxCore {
            link,
            state: StdMutex::new(MuxState {
                next_id: 0,
                inboxes: HashMap::new(),
            }),
            done: CancellationToken::new(),
            first_err: StdMutex::new(None),
        });
        let (accept_tx, accept_rx) = mpsc::channel(1);
        let loop_core = core.clone();
        tokio::spawn(receive_loop(loop_core, accepts.then_some(accept_tx)));
        Self {
            core,
            accepts: accepts.then_some(Mutex::new(accept_rx)),
        }
    }

    /// Open a new sub-link. Connector role only.
    pub async fn connect(&self) -> Result<SubLink> {
        let (id, rx) = self.core.allocate();
        if self.core.done.is_cancelled() {
            return Err(self.core.latched());
        }
        self.core
            .link
            .send(Payload::Frame(Frame::open(id)))
            .await?;
        Ok(SubLink::new(self.core.clone(), id, rx))
    }

    /// Wait for the peer to open a sub-link. Listener role only.
    pub async fn accept(&self) -> Result<SubLink> {
        let accepts = self.accepts.as_ref().ok_or_else(|| {
            Error::ProtocolViolation("multiplexer cannot accept sub-links".into())
        })?;
        let mut rx = accepts.lock().await;
        match rx.recv().await {
            Some(sub) => Ok(sub),
            None => Err(self.core.latched()),
        }
    }

    /// Tear down every sub-link and the underlying link.
    pub async fn close(&self) {
        self.core.shutdown("multiplexer closed").await;
    }
}

async fn receive_loop(core: Arc<MuxCore>, accept_tx: Option<mpsc::Sender<SubLink>>) {
    loop {
        let msg = tokio::select! {
            _ = core.done.cancelled() => break,
            res = core.link.receive() => match res {
                Ok(msg) => msg,
                Err(err) => {
                    core.latch(&err.to_string());
                    break;
                }
            },
        };
        let frame = match msg {
            Payload::Frame(frame) => frame,
            other => {
                core.latch(&format!("unexpected multiplexer payload: {:?}", other));
                break;
            }
        };

        if frame.new {
            let Some(accept_tx) = &accept_tx else {
                core.latch("peer opened a sub-link towards the connector side");
                break;
            };
            let (id, rx) = core.allocate();
            let sub = SubLink::new(core.clone(), id, rx);
            tokio::select! {
                _ = core.done.cancelled() => break,
                res = accept_tx.send(sub) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        } else if frame.close || frame.close_ack {
            if frame.close {
                // Exactly one ack per close frame, even for ids we no
                // longer know about.
                let _ = core
                    .link
                    .send(Payload::Frame(Frame::shut_ack(frame.id)))
                    .await;
            }
            let inbox = core.state.lock().unwrap().inboxes.remove(&frame.id);
            if let Some(inbox) = inbox {
                tokio::select! {
                    _ = core.done.cancelled() => break,
                    _ = inbox.send(SubMsg::Eof) => {}
                }
            }
        } else if let Some(payload) = frame.payload {
            let inbox = core.state.lock().unwrap().inboxes.get(&frame.id).cloned();
            if let Some(inbox) = inbox {
                tokio::select! {
                    _ = core.done.cancelled() => break,
                    _ = inbox.send(SubMsg::Data(*payload)) => {}
                }
            }
        }
    }

    core.shutdown("multiplexer closed").await;
    // Dropping the senders wakes every blocked sub-link reader.
    let inboxes = std::mem::take(&mut core.state.lock().unwrap().inboxes);
    drop(inboxes);
}

/// One logical stream inside a [`Multiplexer`]. Also an [`ObjectLink`], so
/// another multiplexer tier can be stacked on top.
pub struct SubLink {
    core: Arc<MuxCore>,
    id: i64,
    rx: Mutex<mpsc::Receiver<SubMsg>>,
    eof: AtomicBool,
}

impl SubLink {
    fn new(core: Arc<MuxCore>, id: i64, rx: mpsc::Receiver<SubMsg>) -> Self {
        Self {
            core,
            id,
            rx: Mutex::new(rx),
            eof: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

#[async_trait]
impl ObjectLink for SubLink {
    async fn send(&self, value: Payload) -> Result<()> {
        if self.core.done.is_cancelled() {
            return Err(self.core.latched());
        }
        self.core
            .link
            .send(Payload::Frame(Frame::data(self.id, value)))
            .await
    }

    async fn receive(&self) -> Result<Payload> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(SubMsg::Data(payload)) => Ok(payload),
            Some(SubMsg::Eof) => {
                self.eof.store(true, Ordering::Release);
                Err(Error::SubLinkClosed)
            }
            None => {
                if self.eof.load(Ordering::Acquire) {
                    Err(Error::SubLinkClosed)
                } else {
                    Err(self.core.latched())
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.core
            .link
            .send(Payload::Frame(Frame::shut(self.id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::link::FramedLink;
    use tokio::net::{TcpListener, TcpStream};

    async fn mux_pair() -> (Multiplexer, Multiplexer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        });
        let connector = Multiplexer::connector(Arc::new(FramedLink::new(client.unwrap())));
        let acceptor = Multiplexer::listener(Arc::new(FramedLink::new(server.unwrap())));
        (connector, acceptor)
    }

    #[tokio::test]
    async fn routes_sub_links_independently() {
        let (connector, acceptor) = mux_pair().await;

        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();
        let a_remote = acceptor.accept().await.unwrap();
        let b_remote = acceptor.accept().await.unwrap();

        b.send(Payload::Int(2)).await.unwrap();
        a.send(Payload::Int(1)).await.unwrap();

        assert_eq!(a_remote.receive().await.unwrap(), Payload::Int(1));
        assert_eq!(b_remote.receive().await.unwrap(), Payload::Int(2));
    }

    #[tokio::test]
    async fn close_delivers_eof_to_both_ends() {
        let (connector, acceptor) = mux_pair().await;

        let local = connector.connect().await.unwrap();
        let remote = acceptor.accept().await.unwrap();

        local.close().await.unwrap();
        assert!(remote.receive().await.unwrap_err().is_eof());
        // The ack also ends the closing side's stream.
        assert!(local.receive().await.unwrap_err().is_eof());
        // Closing again is harmless.
        local.close().await.unwrap();
        assert!(local.receive().await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn stacks_recursively() {
        let (connector, acceptor) = mux_pair().await;

        let outer_local = Arc::new(connector.connect().await.unwrap());
        let outer_remote = Arc::new(acceptor.accept().await.unwrap());

        let inner_connector = Multiplexer::connector(outer_local);
        let inner_acceptor = Multiplexer::listener(outer_remote);

        let sub = inner_connector.connect().await.unwrap();
        let sub_remote = inner_acceptor.accept().await.unwrap();
        sub.send(Payload::Str("nested".into())).await.unwrap();
        assert_eq!(
            sub_remote.receive().await.unwrap(),
            Payload::Str("nested".into())
        );
    }

    #[tokio::test]
    async fn mux_close_fails_all_sub_links() {
        let (connector, acceptor) = mux_pair().await;
        let local = connector.connect().await.unwrap();
        let _remote = acceptor.accept().await.unwrap();

        connector.close().await;
        let err = local.receive().await.unwrap_err();
        assert!(matches!(err, Error::LinkDead(_)));
        assert!(local.send(Payload::Nil).await.is_err());
    }
}
