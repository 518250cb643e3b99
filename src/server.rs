use crate::{balancer::Dispatcher, listeners::RemoteAddress};
use futures::Future;
use futures::TryFutureExt;
use hyper::{
  server::accept::Accept,
  service::{make_service_fn, Service},
  Body, Request, Response, Server,
};
use log::debug;
use std::{
  error::Error,
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite};

pub async fn create<I, IE, IO>(acceptor: I, dispatcher: Arc<Dispatcher>) -> Result<(), io::Error>
where
  I: Accept<Conn = IO, Error = IE>,
  IE: Into<Box<dyn Error + Send + Sync>>,
  IO: AsyncRead + AsyncWrite + Unpin + Send + RemoteAddress + 'static,
{
  let service = make_service_fn(move |stream: &IO| {
    let client_address = stream.remote_addr();
    let dispatcher = dispatcher.clone();

    async move {
      Ok::<_, io::Error>(MainService {
        client_address: client_address?,
        dispatcher,
      })
    }
  });
  Server::builder(acceptor)
    .serve(service)
    .map_err(|e| {
      io::Error::new(io::ErrorKind::Other, format!("Balancer server stopped: {}", e))
    })
    .await
}

pub struct MainService {
  client_address: SocketAddr,
  dispatcher: Arc<Dispatcher>,
}

impl Service<Request<Body>> for MainService {
  type Response = Response<Body>;
  type Error = hyper::Error;

  #[allow(clippy::type_complexity)]
  type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, request: Request<Body>) -> Self::Future {
    debug!(
      "{} {:?} {} {}",
      self.client_address,
      request.version(),
      request.method(),
      request.uri()
    );

    let dispatcher = self.dispatcher.clone();
    Box::pin(async move { Ok(dispatcher.dispatch(request).await) })
  }
}
