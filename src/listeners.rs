use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use log::{debug, error};
use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
  time::Duration,
};
use tokio::{
  net::{TcpListener, TcpStream},
  sync::mpsc::{unbounded_channel, UnboundedSender},
};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct HyperAcceptor<'a, T> {
  acceptor: Pin<Box<dyn Stream<Item = Result<T, io::Error>> + Send + 'a>>,
  local_addr: SocketAddr,
}

impl<T> HyperAcceptor<'_, T> {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
}

impl<T> hyper::server::accept::Accept for HyperAcceptor<'_, T> {
  type Conn = T;
  type Error = io::Error;

  fn poll_accept(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    Pin::new(&mut self.acceptor).poll_next(cx)
  }
}

#[async_trait]
pub trait AcceptorProducer<T> {
  async fn produce_acceptor(self, address: SocketAddr) -> Result<HyperAcceptor<'async_trait, T>, io::Error>;
}

pub struct Http;

#[async_trait]
impl AcceptorProducer<TcpStream> for Http {
  async fn produce_acceptor(self, address: SocketAddr) -> Result<HyperAcceptor<'async_trait, TcpStream>, io::Error> {
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;

    let incoming_stream = stream! {
      loop {
          match listener.accept().await {
            Ok((socket, _)) => yield Ok::<_, io::Error>(socket),
            Err(e) => recover_from_accept_error(e).await,
          }
      }
    };

    Ok(HyperAcceptor {
      acceptor: Box::pin(incoming_stream),
      local_addr,
    })
  }
}

pub struct Https {
  pub tls_config: ServerConfig,
}

#[async_trait]
impl AcceptorProducer<TlsStream<TcpStream>> for Https {
  async fn produce_acceptor(
    self,
    address: SocketAddr,
  ) -> Result<HyperAcceptor<'async_trait, TlsStream<TcpStream>>, io::Error> {
    let tls_acceptor = TlsAcceptor::from(Arc::new(self.tls_config));
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;
    let (handshakes, mut established) = unbounded_channel();

    // handshakes run in their own tasks, a client that never sends its hello only holds up itself
    let incoming_stream = stream! {
      loop {
          let ready = tokio::select! {
            accepted = listener.accept() => {
              match accepted {
                Ok((socket, remote)) => spawn_handshake(tls_acceptor.clone(), socket, remote, handshakes.clone()),
                Err(e) => recover_from_accept_error(e).await,
              }
              None
            }
            Some(tls_stream) = established.recv() => Some(tls_stream),
          };
          if let Some(tls_stream) = ready {
            yield Ok::<_, io::Error>(tls_stream);
          }
      }
    };

    Ok(HyperAcceptor {
      acceptor: Box::pin(incoming_stream),
      local_addr,
    })
  }
}

fn spawn_handshake(
  tls_acceptor: TlsAcceptor,
  socket: TcpStream,
  remote: SocketAddr,
  handshakes: UnboundedSender<TlsStream<TcpStream>>,
) {
  tokio::spawn(async move {
    match tls_acceptor.accept(socket).await {
      Ok(tls_stream) => {
        let _ = handshakes.send(tls_stream);
      }
      Err(e) => error!("Failed to accept TLS socket from {}: {}", remote, e),
    }
  });
}

/// Accept failures never end the listener. A connection that died in the backlog is skipped; anything else,
/// such as running out of file descriptors, pauses accepting for a moment.
async fn recover_from_accept_error(error: io::Error) {
  if is_connection_error(&error) {
    debug!("Connection dropped before accept: {}", error);
  } else {
    error!("Failed to accept connection, retrying in {:?}: {}", ACCEPT_ERROR_BACKOFF, error);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
  }
}

fn is_connection_error(error: &io::Error) -> bool {
  matches!(
    error.kind(),
    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
  )
}

pub trait RemoteAddress {
  fn remote_addr(&self) -> io::Result<SocketAddr>;
}

impl RemoteAddress for TcpStream {
  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.peer_addr()
  }
}

impl RemoteAddress for TlsStream<TcpStream> {
  fn remote_addr(&self) -> io::Result<SocketAddr> {
    let (stream, _) = self.get_ref();
    stream.peer_addr()
  }
}
