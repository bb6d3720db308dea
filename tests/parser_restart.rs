//! Parser restartability: feeding a request stream in any chunking must
//! produce exactly the result of feeding it whole.

use ember::http::{Method, Parse, Parser, Version};
use ember::Buffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, PartialEq, Eq)]
struct Outcome {
    method: Method,
    version: Version,
    uri: Vec<u8>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Feeds `input` split at the given boundaries and requires the parser to
/// suspend cleanly between chunks and complete on the last one.
fn parse_chunked(input: &[u8], boundaries: &[usize]) -> Outcome {
    let mut buf = Buffer::with_capacity(4096);
    let mut parser = Parser::new();
    let mut headers = Vec::new();

    let mut fed = 0;
    let mut done = false;
    let mut cuts = boundaries.iter().copied().chain(std::iter::once(input.len()));
    while let Some(cut) = cuts.next() {
        buf.write(&input[fed..cut]).unwrap();
        fed = cut;
        match parser
            .parse(&mut buf, |name, value| {
                headers.push((name.to_vec(), value.to_vec()));
            })
            .expect("valid request failed to parse")
        {
            Parse::Complete => {
                done = true;
                break;
            }
            Parse::Partial => {}
        }
    }
    assert!(done, "parser never completed");

    let uri = parser.uri().unwrap();
    Outcome {
        method: parser.method().unwrap(),
        version: parser.version().unwrap(),
        uri: buf.bytes(uri).to_vec(),
        headers,
    }
}

fn random_request(rng: &mut StdRng) -> Vec<u8> {
    const METHODS: &[&str] = &["GET", "HEAD", "POST", "OPTIONS", "DELETE", "TRACE", "CONNECT"];
    const PATH_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.~%/";
    const VALUE_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-./:;=";

    let mut request = Vec::new();
    request.extend_from_slice(METHODS[rng.random_range(0..METHODS.len())].as_bytes());
    request.push(b' ');
    request.push(b'/');
    for _ in 0..rng.random_range(0..40) {
        request.push(PATH_CHARS[rng.random_range(0..PATH_CHARS.len())]);
    }
    request.extend_from_slice(if rng.random_bool(0.5) {
        b" HTTP/1.1\r\n"
    } else {
        b" HTTP/1.0\r\n"
    });

    for _ in 0..rng.random_range(0..6) {
        for _ in 0..rng.random_range(1..12) {
            let c = rng.random_range(b'a'..=b'z');
            request.push(c);
        }
        request.extend_from_slice(b": ");
        for _ in 0..rng.random_range(1..20) {
            request.push(VALUE_CHARS[rng.random_range(0..VALUE_CHARS.len())]);
        }
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    request
}

#[test]
fn byte_by_byte_equals_single_chunk() {
    let input: &[u8] =
        b"GET /some/long.path?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: text/html\r\n\r\n";

    let whole = parse_chunked(input, &[]);
    let bytewise = parse_chunked(input, &(1..input.len()).collect::<Vec<_>>());
    assert_eq!(whole, bytewise);
}

#[test]
fn random_chunkings_are_equivalent() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..50 {
        let input = random_request(&mut rng);
        let whole = parse_chunked(&input, &[]);

        for _ in 0..8 {
            let mut boundaries: Vec<usize> = (0..rng.random_range(1..6))
                .map(|_| rng.random_range(1..input.len()))
                .collect();
            boundaries.sort_unstable();
            boundaries.dedup();

            let chunked = parse_chunked(&input, &boundaries);
            assert_eq!(whole, chunked, "chunking {boundaries:?} diverged");
        }
    }
}

#[test]
fn pipelined_second_request_is_untouched() {
    // Bytes past the terminating CRLF stay in the buffer for the caller.
    let mut buf = Buffer::with_capacity(4096);
    buf.write(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").unwrap();

    let mut parser = Parser::new();
    assert_eq!(parser.parse(&mut buf, |_, _| {}), Ok(Parse::Complete));
    assert_eq!(buf.readable(), b"GET /b HTTP/1.1\r\n\r\n");
}
