//! HTTP proxy request parser

use super::{is_hop_by_hop, ParsedRequest, MAX_HEADER_SIZE};
use crate::error::ParseError;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Read and parse one request header block, giving up after `limit` if set.
pub async fn read_request_with_timeout<R>(
    stream: &mut R,
    limit: Option<Duration>,
) -> Result<ParsedRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, read_request(stream))
            .await
            .map_err(|_| ParseError::Timeout)?,
        None => read_request(stream).await,
    }
}

/// Read and parse one request header block.
///
/// Reads accumulate in a fixed buffer of [`MAX_HEADER_SIZE`] bytes. Anything
/// received past the blank line is kept in [`ParsedRequest::leftover`].
pub async fn read_request<R>(stream: &mut R) -> Result<ParsedRequest, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; MAX_HEADER_SIZE];
    let mut received = 0;

    let end = loop {
        if received == MAX_HEADER_SIZE {
            return Err(ParseError::HeaderTooLong);
        }

        let n = stream.read(&mut buffer[received..]).await?;
        if n == 0 {
            return Err(ParseError::ConnectionClosed);
        }

        // The terminator may have started in the previous read
        let scan_from = resume_point(&buffer[..received]);
        received += n;

        if let Some(end) = find_header_end(&buffer[..received], scan_from) {
            break end;
        }
    };

    let leftover = Bytes::copy_from_slice(&buffer[end..received]);
    parse_header_block(&buffer[..end], leftover)
}

/// Position just past the first pair of newlines at or after `from`, with
/// carriage returns ignored in between.
pub fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut seen_newline = false;

    for (i, &byte) in buf.iter().enumerate().skip(from) {
        match byte {
            b'\n' if seen_newline => return Some(i + 1),
            b'\n' => seen_newline = true,
            b'\r' => {}
            _ => seen_newline = false,
        }
    }

    None
}

/// Where to resume the terminator scan once more bytes arrive.
///
/// A newline followed only by carriage returns may be the first half of a
/// terminator, so the scan restarts at that newline; otherwise nothing
/// already scanned can contribute and it restarts after the trailing
/// carriage returns.
fn resume_point(scanned: &[u8]) -> usize {
    let trailing_cr = scanned.iter().rev().take_while(|&&b| b == b'\r').count();
    let tail = scanned.len() - trailing_cr;

    match tail.checked_sub(1) {
        Some(i) if scanned[i] == b'\n' => i,
        _ => tail,
    }
}

/// Parse a complete header block (terminator included).
pub fn parse_header_block(header: &[u8], leftover: Bytes) -> Result<ParsedRequest, ParseError> {
    let mut lines = header
        .split(|&b| b == b'\n')
        .map(trim_carriage_returns)
        .filter(|line| !line.is_empty());

    let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;

    let fields: Vec<&[u8]> = request_line.split(|&b| b == b' ').collect();
    if fields.len() != 3 {
        return Err(ParseError::InvalidRequestLine);
    }

    let method = String::from_utf8_lossy(fields[0]).into_owned();
    let version = String::from_utf8_lossy(trim(fields[2])).into_owned();
    let tunnel = method.eq_ignore_ascii_case("CONNECT");

    let mut host_header = None;
    let rewritten = if tunnel {
        for line in lines {
            let (name, value) = split_header(line)?;
            if name.eq_ignore_ascii_case(b"host") {
                host_header = Some(value);
                break;
            }
        }
        None
    } else {
        // Built from the raw bytes so header values pass through untouched
        let mut out = Vec::with_capacity(header.len());
        out.extend_from_slice(request_line);

        for line in lines {
            let (name, value) = split_header(line)?;
            if !std::str::from_utf8(name).map_or(false, is_hop_by_hop) {
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(name);
                out.extend_from_slice(b": ");
                out.extend_from_slice(value);
            }
            if name.eq_ignore_ascii_case(b"host") {
                host_header = Some(value);
            }
        }

        out.extend_from_slice(b"\r\n\r\n");
        Some(Bytes::from(out))
    };

    let host_header = host_header.ok_or(ParseError::MissingHost)?;
    let host_header = std::str::from_utf8(host_header).map_err(|_| ParseError::InvalidHost)?;
    let (host, port) = split_host_port(host_header, if tunnel { 443 } else { 80 })?;

    debug!(
        "Parsed {} request for {}:{} ({} bytes buffered)",
        method,
        host,
        port,
        leftover.len()
    );

    Ok(ParsedRequest {
        method,
        tunnel,
        host,
        port,
        version,
        rewritten,
        leftover,
    })
}

fn split_header(line: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    Ok((trim(&line[..colon]), trim(&line[colon + 1..])))
}

fn trim_carriage_returns(line: &[u8]) -> &[u8] {
    let end = line.iter().rposition(|&b| b != b'\r').map_or(0, |i| i + 1);
    &line[..end]
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Split a Host header value into host and port.
fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    if value.is_empty() {
        return Err(ParseError::InvalidHost);
    }

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or(ParseError::InvalidHost)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or(ParseError::InvalidHost)?)),
        }
    } else {
        match value.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    if host.is_empty() {
        return Err(ParseError::InvalidHost);
    }

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| ParseError::InvalidHost)?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn parse(raw: &[u8]) -> Result<ParsedRequest, ParseError> {
        let end = find_header_end(raw, 0).expect("terminator");
        parse_header_block(&raw[..end], Bytes::copy_from_slice(&raw[end..]))
    }

    #[test]
    fn test_terminator_variants() {
        assert_eq!(find_header_end(b"a\n\nrest", 0), Some(3));
        assert_eq!(find_header_end(b"a\r\n\r\nrest", 0), Some(5));
        assert_eq!(find_header_end(b"a\r\n\nrest", 0), Some(4));
        assert_eq!(find_header_end(b"a\n\r\nrest", 0), Some(4));
        assert_eq!(find_header_end(b"a\r\r\r\r\n\nrest", 0), Some(7));
        assert_eq!(find_header_end(b"a\r\nb\r\n", 0), None);
        assert_eq!(find_header_end(b"a\nb\nc", 0), None);
    }

    #[test]
    fn test_parse_connect() {
        let req = parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n").unwrap();
        assert!(req.tunnel);
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 8443);
        assert_eq!(req.version, "HTTP/1.1");
        assert!(req.rewritten.is_none());
        assert!(req.leftover.is_empty());
    }

    #[test]
    fn test_connect_method_case_insensitive() {
        let req = parse(b"connect example.com:443 HTTP/1.1\r\nhost: example.com\r\n\r\n").unwrap();
        assert!(req.tunnel);
        assert_eq!(req.port, 443);
    }

    #[test]
    fn test_parse_forward_strips_hop_by_hop() {
        let req = parse(
            b"GET http://example.com/ HTTP/1.1\r\n\
              Host: example.com\r\n\
              Connection: keep-alive\r\n\
              proxy-authorization: Basic abc\r\n\
              Accept: */*\r\n\
              TRANSFER-ENCODING: chunked\r\n\r\n",
        )
        .unwrap();

        assert!(!req.tunnel);
        assert_eq!(req.port, 80);
        assert_eq!(
            req.rewritten.unwrap(),
            Bytes::from_static(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
            )
        );
    }

    #[test]
    fn test_header_values_are_trimmed() {
        let req = parse(b"GET / HTTP/1.0\nHost:   example.com:8080  \nX-A:b\n\n").unwrap();
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 8080);
        assert_eq!(req.version, "HTTP/1.0");
        assert_eq!(
            req.rewritten.unwrap(),
            Bytes::from_static(b"GET / HTTP/1.0\r\nHost: example.com:8080\r\nX-A: b\r\n\r\n")
        );
    }

    #[test]
    fn test_bracketed_ipv6_host() {
        let req = parse(b"CONNECT [::1]:8443 HTTP/1.1\r\nHost: [::1]:8443\r\n\r\n").unwrap();
        assert_eq!(req.host, "::1");
        assert_eq!(req.port, 8443);

        let req = parse(b"GET / HTTP/1.1\r\nHost: [2001:db8::1]\r\n\r\n").unwrap();
        assert_eq!(req.host, "2001:db8::1");
        assert_eq!(req.port, 80);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse(b"GET /\r\nHost: a\r\n\r\n"),
            Err(ParseError::InvalidRequestLine)
        ));
        assert!(matches!(
            parse(b"GET  / HTTP/1.1\r\nHost: a\r\n\r\n"),
            Err(ParseError::InvalidRequestLine)
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nbogus header\r\n\r\n"),
            Err(ParseError::InvalidHeader)
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(ParseError::MissingHost)
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost:\r\n\r\n"),
            Err(ParseError::InvalidHost)
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost: a:notaport\r\n\r\n"),
            Err(ParseError::InvalidHost)
        ));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost: a:70000\r\n\r\n"),
            Err(ParseError::InvalidHost)
        ));
        assert!(matches!(parse(b"\r\n\r\n"), Err(ParseError::InvalidRequestLine)));
    }

    #[test]
    fn test_tunnel_stops_at_first_host() {
        // Header lines after Host are not inspected in tunnel mode
        let req = parse(b"CONNECT a:1 HTTP/1.1\r\nHost: a:1\r\nbroken line\r\n\r\n").unwrap();
        assert_eq!(req.host, "a");
        assert_eq!(req.port, 1);
    }

    #[tokio::test]
    async fn test_terminator_split_across_reads() {
        let whole = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\nbody";
        let mut single = Builder::new().read(whole).build();
        let expected = read_request(&mut single).await.unwrap();

        let mut split = Builder::new()
            .read(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r")
            .read(b"\nbody")
            .build();
        let actual = read_request(&mut split).await.unwrap();

        assert_eq!(actual, expected);
        assert_eq!(actual.leftover, Bytes::from_static(b"body"));
    }

    #[tokio::test]
    async fn test_split_bare_newlines() {
        let mut mock = Builder::new()
            .read(b"CONNECT h:1 HTTP/1.1\nHost: h:1\n")
            .read(b"\n")
            .build();
        let req = read_request(&mut mock).await.unwrap();
        assert_eq!(req.port, 1);
    }

    #[tokio::test]
    async fn test_split_after_carriage_return_run() {
        let mut mock = Builder::new()
            .read(b"GET / HTTP/1.1\nHost: a\n\r\r\r")
            .read(b"\n")
            .build();
        let req = read_request(&mut mock).await.unwrap();
        assert_eq!(req.host, "a");
        assert!(req.leftover.is_empty());
    }

    #[test]
    fn test_resume_point() {
        assert_eq!(resume_point(b""), 0);
        assert_eq!(resume_point(b"Host: a"), 7);
        assert_eq!(resume_point(b"Host: a\n"), 7);
        assert_eq!(resume_point(b"Host: a\n\r\r\r"), 7);
        assert_eq!(resume_point(b"Host: a\r\r"), 7);
    }

    #[test]
    fn test_non_utf8_header_value_forwarded_verbatim() {
        let req = parse(b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Name: caf\xe9\r\n\r\n").unwrap();
        assert_eq!(
            req.rewritten.unwrap(),
            Bytes::from_static(b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Name: caf\xe9\r\n\r\n")
        );
    }

    #[test]
    fn test_non_utf8_host_rejected() {
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nHost: ex\xffample.com\r\n\r\n"),
            Err(ParseError::InvalidHost)
        ));
    }

    #[tokio::test]
    async fn test_header_limit() {
        // 8192 bytes without a terminator
        let mut line = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        line.resize(MAX_HEADER_SIZE, b'a');
        let mut mock = Builder::new().read(&line[..4096]).read(&line[4096..]).build();
        assert!(matches!(read_request(&mut mock).await, Err(ParseError::HeaderTooLong)));

        // 8191 bytes ending in the terminator
        let mut ok = b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Pad: ".to_vec();
        ok.resize(MAX_HEADER_SIZE - 5, b'a');
        ok.extend_from_slice(b"\r\n\r\n");
        assert_eq!(ok.len(), MAX_HEADER_SIZE - 1);
        let mut mock = Builder::new().read(&ok).build();
        let req = read_request(&mut mock).await.unwrap();
        assert_eq!(req.host, "example.com");
        assert!(req.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_client_closes_early() {
        let mut mock = Builder::new().read(b"GET / HTTP/1.1\r\n").build();
        assert!(matches!(read_request(&mut mock).await, Err(ParseError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_header_timeout() {
        let (mut client, _server) = tokio::io::duplex(64);
        let result = read_request_with_timeout(&mut client, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(ParseError::Timeout)));
    }
}
