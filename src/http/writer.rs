use crate::http::framing::Framing;
use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::response::Response;

pub fn serialize_request(req: &Request) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + req.body.len());

    // Request line
    let request_line = format!("{} {} {}\r\n", req.method, req.uri, req.version);
    buf.extend_from_slice(request_line.as_bytes());

    req.headers.write_to(&mut buf);
    buf.extend_from_slice(b"\r\n");

    write_body(&mut buf, &req.body, req.framing, &req.trailer);
    buf
}

pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body.len());

    // Status line
    let status_line = format!("{} {} {}\r\n", resp.version, resp.status.as_u16(), resp.reason);
    buf.extend_from_slice(status_line.as_bytes());

    resp.headers.write_to(&mut buf);
    buf.extend_from_slice(b"\r\n");

    write_body(&mut buf, &resp.body, resp.framing, &resp.trailer);
    buf
}

fn write_body(buf: &mut Vec<u8>, body: &[u8], framing: Framing, trailer: &Headers) {
    match framing {
        Framing::Chunked => {
            if !body.is_empty() {
                buf.extend_from_slice(format!("{:X}\r\n", body.len()).as_bytes());
                buf.extend_from_slice(body);
                buf.extend_from_slice(b"\r\n");
            }
            buf.extend_from_slice(b"0\r\n");
            trailer.write_to(buf);
            buf.extend_from_slice(b"\r\n");
        }
        _ => buf.extend_from_slice(body),
    }
}
