//! HTTP trackers, BEP 3 with the compact peer list of BEP 23.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bendy::decoding::{self, FromBencode, Object, ResultExt};
use reqwest::Client;
use tracing::debug;

use super::{AnnounceRequest, AnnounceResponse, TrackerPort};
use crate::error::Error;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, Error> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::TrackerFailure(format!(
                "unsupported tracker url `{url}`"
            )));
        }

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self { client, url: url.to_string() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The announce url with every query parameter.
    pub fn announce_url(&self, req: &AnnounceRequest) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{}{sep}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&key={}&numwant={}&compact=1&no_peer_id=1",
            self.url,
            urlencoding::encode_binary(&req.info_hash.0),
            urlencoding::encode_binary(&req.peer_id.0),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
            req.key,
            req.numwant,
        );

        if let Some(event) = req.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }

        if let Some(id) = &req.tracker_id {
            url.push_str("&trackerid=");
            url.push_str(&urlencoding::encode(id));
        }

        url
    }
}

impl TrackerPort for HttpTracker {
    async fn announce(
        &mut self,
        request: AnnounceRequest,
    ) -> Result<AnnounceResponse, Error> {
        let url = self.announce_url(&request);
        debug!("GET {url}");

        let body = self.client.get(&url).send().await?.bytes().await?;

        parse_announce_response(&body)
    }
}

/// Decode the bencoded body of an announce response.
pub fn parse_announce_response(buf: &[u8]) -> Result<AnnounceResponse, Error> {
    let raw = RawResponse::from_bencode(buf)?;

    if let Some(reason) = raw.failure {
        return Err(Error::TrackerFailure(reason));
    }

    let interval = raw.interval.ok_or(Error::TrackerResponse)?;

    Ok(AnnounceResponse {
        peers: raw.peers,
        interval: clamp(interval),
        min_interval: raw.min_interval.map(clamp),
        tracker_id: raw.tracker_id,
        complete: raw.complete.map(clamp),
        incomplete: raw.incomplete.map(clamp),
        warning: raw.warning,
    })
}

fn clamp(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

/// Support for BEP23. IPv4 addresses come in packets of 6 bytes, first 4
/// for the ip and 2 for the port, in network order.
pub fn parse_compact_peer_list(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    Ok(chunks
        .map(|c| {
            let ip = IpAddr::from(Ipv4Addr::new(c[0], c[1], c[2], c[3]));
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(ip, port)
        })
        .collect())
}

#[derive(Debug, Default)]
struct RawResponse {
    failure: Option<String>,
    warning: Option<String>,
    interval: Option<u64>,
    min_interval: Option<u64>,
    tracker_id: Option<String>,
    complete: Option<u64>,
    incomplete: Option<u64>,
    peers: Vec<SocketAddr>,
}

impl FromBencode for RawResponse {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut res = RawResponse::default();

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"failure reason", value) => {
                    res.failure = String::decode_bencode_object(value)
                        .context("failure reason")
                        .map(Some)?;
                }
                (b"warning message", value) => {
                    res.warning = String::decode_bencode_object(value)
                        .context("warning message")
                        .map(Some)?;
                }
                (b"interval", value) => {
                    res.interval = u64::decode_bencode_object(value)
                        .context("interval")
                        .map(Some)?;
                }
                (b"min interval", value) => {
                    res.min_interval = u64::decode_bencode_object(value)
                        .context("min interval")
                        .map(Some)?;
                }
                (b"tracker id", value) => {
                    res.tracker_id = String::decode_bencode_object(value)
                        .context("tracker id")
                        .map(Some)?;
                }
                (b"complete", value) => {
                    res.complete = u64::decode_bencode_object(value)
                        .context("complete")
                        .map(Some)?;
                }
                (b"incomplete", value) => {
                    res.incomplete = u64::decode_bencode_object(value)
                        .context("incomplete")
                        .map(Some)?;
                }
                (b"peers", Object::Bytes(bytes)) => {
                    res.peers = parse_compact_peer_list(bytes)
                        .map_err(decoding::Error::malformed_content)?;
                }
                (b"peers", Object::List(mut list)) => {
                    while let Some(peer) = list.next_object()? {
                        let peer = DictPeer::decode_bencode_object(peer)
                            .context("peers")?;
                        // hostnames are skipped
                        if let Ok(ip) = peer.ip.parse::<IpAddr>() {
                            res.peers.push(SocketAddr::new(ip, peer.port));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(res)
    }
}

/// A peer of the non-compact peer list.
struct DictPeer {
    ip: String,
    port: u16,
}

impl FromBencode for DictPeer {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut ip = None;
        let mut port = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"ip", value) => {
                    ip = String::decode_bencode_object(value)
                        .context("ip")
                        .map(Some)?;
                }
                (b"port", value) => {
                    port = u16::decode_bencode_object(value)
                        .context("port")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let ip = ip.ok_or_else(|| decoding::Error::missing_field("ip"))?;
        let port = port.ok_or_else(|| decoding::Error::missing_field("port"))?;

        Ok(DictPeer { ip, port })
    }
}
