use crate::{
    amount::MilliSatoshi,
    payment::PaymentSecret,
    route::{HopStyle, RouteHop, ShortChannelId},
};
use bitcoin::{hashes::Hash, secp256k1::PublicKey};

/// TLV record types of the BOLT4 per-hop payload.
const TLV_AMT_TO_FORWARD: u64 = 2;
const TLV_OUTGOING_CLTV_VALUE: u64 = 4;
const TLV_SHORT_CHANNEL_ID: u64 = 6;
const TLV_PAYMENT_DATA: u64 = 8;

/// One hop handed to the onion constructor: who it is for and the payload
/// only they can read.
#[derive(Clone, Debug, PartialEq)]
pub struct OnionHop {
    pub node_id: PublicKey,
    pub payload: Vec<u8>,
}

/// Request for the onion constructor collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct OnionRequest {
    pub hops: Vec<OnionHop>,
    pub assocdata: Vec<u8>,
    pub session_key: Option<[u8; 32]>,
}

/// Reply of the onion constructor: the wrapped onion plus the per-hop
/// shared secrets needed to decode a returned failure.
#[derive(Clone, Debug)]
pub struct CreatedOnion {
    pub onion: Vec<u8>,
    pub shared_secrets: Vec<[u8; 32]>,
}

/// Maps a route to the per-hop payload stream.
///
/// The payload at hop `i` tells that node how to forward to hop `i + 1`;
/// the final payload carries the delivery amount, a zero short channel id
/// and, when a payment secret is present, the MPP payment data record.
/// CLTV values are absolutized against `start_block`.
pub fn build_onion_request(
    route: &[RouteHop],
    start_block: u32,
    payment_hash: bitcoin::hashes::sha256::Hash,
    payment_secret: Option<&PaymentSecret>,
    total_msat: MilliSatoshi,
) -> OnionRequest {
    let mut hops = Vec::with_capacity(route.len());

    for (hop, next) in route.iter().zip(route.iter().skip(1)) {
        let payload = match hop.style {
            HopStyle::Legacy => {
                legacy_payload(next.scid, next.amount, start_block + next.delay)
            }
            HopStyle::Tlv => tlv_payload(
                next.amount,
                start_block + next.delay,
                Some(next.scid),
                None,
            ),
        };
        hops.push(OnionHop {
            node_id: hop.node_id,
            payload,
        });
    }

    let last = route.last().expect("route has at least one hop");
    let payload = match last.style {
        HopStyle::Legacy => legacy_payload(
            ShortChannelId::from(0),
            last.amount,
            start_block + last.delay,
        ),
        HopStyle::Tlv => tlv_payload(
            last.amount,
            start_block + last.delay,
            None,
            payment_secret.map(|secret| (*secret, total_msat)),
        ),
    };
    hops.push(OnionHop {
        node_id: last.node_id,
        payload,
    });

    OnionRequest {
        hops,
        assocdata: payment_hash.into_inner().to_vec(),
        session_key: None,
    }
}

/// Legacy hop payload: realm 0, then a fixed 32-byte body.
fn legacy_payload(scid: ShortChannelId, forward: MilliSatoshi, outgoing_cltv: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(33);
    payload.push(0x00);
    payload.extend_from_slice(&scid.to_u64().to_be_bytes());
    payload.extend_from_slice(&forward.as_msat().to_be_bytes());
    payload.extend_from_slice(&outgoing_cltv.to_be_bytes());
    payload.extend_from_slice(&[0u8; 12]);
    payload
}

/// TLV hop payload: a bigsize length prefix followed by the ordered TLV
/// records.
fn tlv_payload(
    forward: MilliSatoshi,
    outgoing_cltv: u32,
    scid: Option<ShortChannelId>,
    payment_data: Option<(PaymentSecret, MilliSatoshi)>,
) -> Vec<u8> {
    let mut stream = Vec::new();

    put_tlv(&mut stream, TLV_AMT_TO_FORWARD, &truncated_be(forward.as_msat()));
    put_tlv(
        &mut stream,
        TLV_OUTGOING_CLTV_VALUE,
        &truncated_be(outgoing_cltv as u64),
    );
    if let Some(scid) = scid {
        put_tlv(&mut stream, TLV_SHORT_CHANNEL_ID, &scid.to_u64().to_be_bytes());
    }
    if let Some((secret, total_msat)) = payment_data {
        let mut value = secret.as_bytes().to_vec();
        value.extend_from_slice(&truncated_be(total_msat.as_msat()));
        put_tlv(&mut stream, TLV_PAYMENT_DATA, &value);
    }

    let mut payload = Vec::with_capacity(stream.len() + 3);
    put_bigsize(&mut payload, stream.len() as u64);
    payload.extend_from_slice(&stream);
    payload
}

fn put_tlv(buf: &mut Vec<u8>, record_type: u64, value: &[u8]) {
    put_bigsize(buf, record_type);
    put_bigsize(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// BOLT1 bigsize integer.
pub fn put_bigsize(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Minimal big-endian encoding of a truncated integer TLV value.
fn truncated_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let leading = value.leading_zeros() as usize / 8;
    bytes[leading..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{route::channel_direction, test_keys};
    use bitcoin::hashes::sha256;

    fn test_route(styles: &[HopStyle]) -> Vec<RouteHop> {
        styles
            .iter()
            .enumerate()
            .map(|(i, style)| RouteHop {
                node_id: test_keys::pubkey(i as u8 + 1),
                scid: ShortChannelId::new(600_000 + i as u32, 1, 0),
                direction: channel_direction(
                    &test_keys::pubkey(i as u8 + 1),
                    &test_keys::pubkey(i as u8 + 2),
                ),
                amount: MilliSatoshi::from_msat(1_000 + 10 * (styles.len() - i) as u64),
                delay: 9 + 6 * (styles.len() - 1 - i) as u32,
                style: *style,
            })
            .collect()
    }

    #[test]
    fn legacy_payload_layout() {
        let payload = legacy_payload(
            ShortChannelId::new(1, 2, 3),
            MilliSatoshi::from_msat(0x0102_0304),
            700_009,
        );

        assert_eq!(payload.len(), 33);
        assert_eq!(payload[0], 0x00);
        assert_eq!(&payload[1..9], &ShortChannelId::new(1, 2, 3).to_u64().to_be_bytes());
        assert_eq!(&payload[9..17], &0x0102_0304u64.to_be_bytes());
        assert_eq!(&payload[17..21], &700_009u32.to_be_bytes());
        assert!(payload[21..].iter().all(|b| *b == 0));
    }

    #[test]
    fn non_final_hop_encodes_the_next_hops_fields() {
        let route = test_route(&[HopStyle::Legacy, HopStyle::Legacy]);
        let payment_hash = sha256::Hash::hash(b"payment");

        let request = build_onion_request(&route, 700_000, payment_hash, None, MilliSatoshi::ZERO);

        assert_eq!(request.hops.len(), 2);
        assert_eq!(request.hops[0].node_id, route[0].node_id);
        assert_eq!(
            request.hops[0].payload,
            legacy_payload(route[1].scid, route[1].amount, 700_000 + route[1].delay)
        );
        // Final hop: zero scid, own amount.
        assert_eq!(
            request.hops[1].payload,
            legacy_payload(
                ShortChannelId::from(0),
                route[1].amount,
                700_000 + route[1].delay
            )
        );
        assert_eq!(request.assocdata, payment_hash.into_inner().to_vec());
        assert_eq!(request.session_key, None);
    }

    #[test]
    fn tlv_payload_layout() {
        let payload = tlv_payload(
            MilliSatoshi::from_msat(1_000),
            700_009,
            Some(ShortChannelId::from(0x0102_0304_0506_0708)),
            None,
        );

        let expected = vec![
            0x13, // bigsize total length: 19
            0x02, 0x02, 0x03, 0xe8, // amt_to_forward: 1000
            0x04, 0x03, 0x0a, 0xae, 0x29, // outgoing_cltv_value: 700009
            0x06, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        assert_eq!(payload, expected);
    }

    #[test]
    fn final_tlv_hop_carries_payment_data() {
        let route = test_route(&[HopStyle::Tlv]);
        let secret = PaymentSecret::from_bytes([0x42; 32]);

        let request = build_onion_request(
            &route,
            700_000,
            sha256::Hash::hash(b"payment"),
            Some(&secret),
            MilliSatoshi::from_msat(20_000),
        );

        let payload = &request.hops[0].payload;
        // The payment_data record is the last one: type 8, length 34
        // (32-byte secret + 2-byte truncated total of 20000).
        let tail = &payload[payload.len() - 36..];
        assert_eq!(tail[0], 0x08);
        assert_eq!(tail[1], 34);
        assert_eq!(&tail[2..34], &[0x42; 32]);
        assert_eq!(&tail[34..], &20_000u16.to_be_bytes());
    }

    #[test]
    fn final_tlv_hop_without_secret_has_no_payment_data() {
        let route = test_route(&[HopStyle::Tlv]);

        let request = build_onion_request(
            &route,
            700_000,
            sha256::Hash::hash(b"payment"),
            None,
            MilliSatoshi::from_msat(20_000),
        );

        // amount 1010 and absolute cltv 700009 only, no scid, no secret.
        assert_eq!(
            request.hops[0].payload,
            vec![0x09, 0x02, 0x02, 0x03, 0xf2, 0x04, 0x03, 0x0a, 0xae, 0x29]
        );
    }

    #[test]
    fn bigsize_boundaries() {
        let mut buf = Vec::new();
        put_bigsize(&mut buf, 0xfc);
        assert_eq!(buf, vec![0xfc]);

        buf.clear();
        put_bigsize(&mut buf, 0xfd);
        assert_eq!(buf, vec![0xfd, 0x00, 0xfd]);

        buf.clear();
        put_bigsize(&mut buf, 0x1_0000);
        assert_eq!(buf, vec![0xfe, 0x00, 0x01, 0x00, 0x00]);

        buf.clear();
        put_bigsize(&mut buf, 0x1_0000_0000);
        assert_eq!(
            buf,
            vec![0xff, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn truncated_integers_drop_leading_zeroes() {
        assert_eq!(truncated_be(0), Vec::<u8>::new());
        assert_eq!(truncated_be(1), vec![0x01]);
        assert_eq!(truncated_be(0x0100), vec![0x01, 0x00]);
    }
}
