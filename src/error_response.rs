use hyper::{Body, Response, StatusCode};

pub fn service_unavailable() -> Response<Body> {
  let mut response = Response::new(Body::from("Service Unavailable"));
  *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
  response
}

pub fn internal_server_error() -> Response<Body> {
  let mut response = Response::new(Body::empty());
  *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
  response
}
