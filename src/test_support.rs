use crate::tls;
use hyper::{
  client::conn,
  header::HOST,
  service::{make_service_fn, service_fn},
  Body, Request, Response, Server, StatusCode,
};
use std::{convert::Infallible, fs::File, io::BufReader, net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{
  client::TlsStream,
  rustls::{ClientConfig, RootCertStore, ServerConfig, ServerName},
  TlsConnector,
};

/// Serves every request with `handler` on a random local port.
pub async fn spawn_backend<F>(handler: F) -> SocketAddr
where
  F: Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static,
{
  let handler = Arc::new(handler);
  let make_service = make_service_fn(move |_| {
    let handler = handler.clone();
    async move {
      Ok::<_, Infallible>(service_fn(move |request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler(request)) }
      }))
    }
  });

  let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
  let address = server.local_addr();
  tokio::spawn(server);
  address
}

/// Backend answering every request with its own name, and with 500 on `/boom`.
pub async fn spawn_named_backend(name: &'static str) -> SocketAddr {
  spawn_backend(move |request| {
    let mut response = Response::new(Body::from(name));
    if request.uri().path() == "/boom" {
      *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    }
    response
  })
  .await
}

/// An address nothing listens on.
pub fn unused_address() -> SocketAddr {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap()
}

fn testdata(name: &str) -> String {
  format!("{}/testdata/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// Listener configuration for `localhost`, signed by `testdata/ca.crt`.
pub fn localhost_tls_config() -> ServerConfig {
  tls::server_config(testdata("localhost.crt"), testdata("localhost.key")).unwrap()
}

/// Connects to `address` and completes a TLS handshake for `localhost`, trusting only `testdata/ca.crt`.
async fn connect_tls(address: SocketAddr) -> TlsStream<TcpStream> {
  let mut ca = BufReader::new(File::open(testdata("ca.crt")).unwrap());
  let mut roots = RootCertStore::empty();
  let (added, _) = roots.add_parsable_certificates(&rustls_pemfile::certs(&mut ca).unwrap());
  assert_eq!(added, 1);

  let client_config = ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let socket = TcpStream::connect(address).await.unwrap();
  TlsConnector::from(Arc::new(client_config))
    .connect(ServerName::try_from("localhost").unwrap(), socket)
    .await
    .unwrap()
}

/// Sends one HTTP/1 GET over TLS and returns the status and body.
pub async fn get_over_tls(address: SocketAddr, path: &str) -> (StatusCode, String) {
  let (mut sender, connection) = conn::handshake(connect_tls(address).await).await.unwrap();
  tokio::spawn(connection);

  let request = Request::get(path).header(HOST, "localhost").body(Body::empty()).unwrap();
  let response = sender.send_request(request).await.unwrap();
  let status = response.status();
  let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
  (status, String::from_utf8(body.to_vec()).unwrap())
}
