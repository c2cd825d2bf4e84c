use http::StatusCode;


error_chain! {
    foreign_links {
        Io(::std::io::Error);
        Utf8(::std::str::Utf8Error);
        AddrParse(::std::net::AddrParseError);
        Http(::http::Error);
    }
    errors {
        MalformedHttpRequest(s: String) {
            description("Malformed HTTP Request")
            display("MalformedHttpRequest: {}", s)
        }
        RequestHeadersTooLarge(s: String) {
            description("Request Headers Too Large")
            display("RequestHeadersTooLarge: {}", s)
        }
        RequestBodyTooLarge(s: String) {
            description("Request Body Too Large")
            display("RequestBodyTooLarge: {}", s)
        }
    }
}


impl Error {
    /// Status code to answer with when this error came out of reading a request.
    /// `None` means the connection is unusable and gets dropped without a reply.
    pub fn response_status(&self) -> Option<StatusCode> {
        match *self.kind() {
            ErrorKind::MalformedHttpRequest(_) |
            ErrorKind::Utf8(_) |
            ErrorKind::Http(_) => Some(StatusCode::BAD_REQUEST),
            ErrorKind::RequestHeadersTooLarge(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            ErrorKind::RequestBodyTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            _ => None,
        }
    }
}
