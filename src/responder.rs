use {Request, Response};


/// Body of every reply
pub const MESSAGE: &'static str = "Message from sample-app";


/// Catch-all handler: `200 OK` with `MESSAGE`, whatever was asked.
pub fn respond(_request: &Request) -> Response {
    Response::new(MESSAGE.as_bytes().to_vec())
}
