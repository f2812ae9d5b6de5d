use hyper::Request;
use tower_http::trace::MakeSpan;
use tracing::{field, Span};

/// Opens one span per HTTP request, tagged with the deployment env and
/// instance id so logs from several replicas can be told apart. Requests
/// tied to an upload session also carry its `session_id`.
#[derive(Clone)]
pub struct InstanceRequestSpan {
    env: String,
    instance_id: String,
}

impl InstanceRequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

/// Upload session named by the request, from `?session_id=` on uploads or
/// the path of a progress stream.
fn request_session<B>(request: &Request<B>) -> Option<String> {
    let uri = request.uri();
    if let Some(session_id) = uri.path().strip_prefix("/progress/") {
        return Some(session_id.to_string()).filter(|id| !id.is_empty());
    }
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(name, _)| name == "session_id")
        .map(|(_, value)| value.into_owned())
}

impl<B> MakeSpan<B> for InstanceRequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let span = tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %request.method(),
            uri = %request.uri().path(),
            session_id = field::Empty,
        );
        if let Some(session_id) = request_session(request) {
            span.record("session_id", session_id.as_str());
        }
        span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_request_session_from_query_or_progress_path() {
        assert_eq!(
            request_session(&request("/upload?email=x&session_id=abc")),
            Some("abc".to_string())
        );
        assert_eq!(
            request_session(&request("/progress/s9")),
            Some("s9".to_string())
        );
        assert_eq!(request_session(&request("/progress/")), None);
        assert_eq!(request_session(&request("/file/k1")), None);
        assert_eq!(request_session(&request("/update/k1?other=1")), None);
    }
}
