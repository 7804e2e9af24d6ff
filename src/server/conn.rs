//! Per-connection protocol selection.
//!
//! A fresh transport goes one of three ways: TLS (ALPN picks h2 or
//! http/1.1), cleartext with the HTTP/2 preface (h2c), or plain HTTP/1.1.
//! Sniffed bytes are always replayed to the winning codec.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::app::Application;
use crate::common::rewind::Rewind;
use crate::proto::{h1, h2};
use crate::server::shared::{ConnInfo, Shared};
use crate::server::shutdown::Watch;
use crate::server::tcp::Accepted;
use crate::tls::Terminator;

/// Drive one accepted transport to completion. Errors are handled here;
/// the accept loop never sees them.
pub(crate) async fn handle<A>(
    accepted: Accepted,
    shared: Arc<Shared<A>>,
    tls: Option<Terminator>,
    watch: Watch,
) where
    A: Application,
{
    let Accepted {
        stream,
        peer,
        local,
    } = accepted;

    let result = match tls {
        Some(terminator) => match terminator.accept(stream).await {
            Ok((tls_stream, tls_info, selected_h2)) => {
                let info = ConnInfo {
                    client: peer,
                    server: local,
                    tls: Some(tls_info),
                };
                if selected_h2 {
                    h2::serve(tls_stream, shared, info, watch).await
                } else {
                    h1::serve(tls_stream, shared, info, watch, BytesMut::new()).await
                }
            }
            Err(err) => {
                // Handshake failures never reach the application.
                debug!("tls handshake failed: {}", err);
                return;
            }
        },
        None => {
            let info = ConnInfo {
                client: peer,
                server: local,
                tls: None,
            };
            if shared.h2c_enabled {
                match sniff_preface(stream).await {
                    Ok((Sniffed::H2, stream, buffered)) => {
                        trace!("h2c preface detected");
                        let io = Rewind::new_buffered(stream, buffered.freeze());
                        h2::serve(io, shared, info, watch).await
                    }
                    Ok((Sniffed::H1, stream, buffered)) => {
                        h1::serve(stream, shared, info, watch, buffered).await
                    }
                    Err(err) => {
                        debug!("connection died during preface sniff: {}", err);
                        return;
                    }
                }
            } else {
                h1::serve(stream, shared, info, watch, BytesMut::new()).await
            }
        }
    };

    if let Err(err) = result {
        debug!("connection ended with error: {}", err);
    }
}

#[derive(Debug)]
enum Sniffed {
    H1,
    H2,
}

/// Read just enough cleartext bytes to decide whether the peer is
/// speaking the HTTP/2 connection preface. The consumed bytes are
/// returned for replay.
async fn sniff_preface<T>(mut stream: T) -> std::io::Result<(Sniffed, T, BytesMut)>
where
    T: AsyncReadExt + Unpin,
{
    let mut buffered = BytesMut::with_capacity(h2::PREFACE.len());
    loop {
        let check = std::cmp::min(buffered.len(), h2::PREFACE.len());
        // Any mismatching prefix settles it early.
        if buffered[..check] != h2::PREFACE[..check] {
            return Ok((Sniffed::H1, stream, buffered));
        }
        if check == h2::PREFACE.len() {
            return Ok((Sniffed::H2, stream, buffered));
        }
        let n = stream.read_buf(&mut buffered).await?;
        if n == 0 {
            return Ok((Sniffed::H1, stream, buffered));
        }
    }
}
