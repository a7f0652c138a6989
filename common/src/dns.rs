//! Captive-portal DNS codec.
//!
//! In access-point mode every DNS query is answered with the device's own
//! address so any browser lands on the provisioning page. This module is
//! the pure wire part; the controller owns the UDP socket and services
//! pending queries once per loop iteration.

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const ANSWER_TTL_SECS: u32 = 60;

/// Build a response to `query` that resolves its first question to `ip`.
///
/// Returns `None` for packets that are not plain queries or are too
/// mangled to echo a question from; the caller drops those silently.
pub fn answer_query(query: &[u8], ip: [u8; 4]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    if flags & FLAG_RESPONSE != 0 {
        return None;
    }

    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount == 0 {
        return None;
    }

    // Walk the first question's name. Queries carry literal labels, never
    // compression pointers.
    let mut pos = HEADER_LEN;
    loop {
        let len = *query.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > 63 {
            return None;
        }
        pos = pos.checked_add(len)?;
        if pos >= query.len() {
            return None;
        }
    }
    let question_end = pos.checked_add(4)?; // QTYPE + QCLASS
    if question_end > query.len() {
        return None;
    }

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]); // transaction id
    response
        .extend_from_slice(&(FLAG_RESPONSE | FLAG_AUTHORITATIVE | (flags & FLAG_RECURSION_DESIRED)).to_be_bytes());
    response.extend_from_slice(&1_u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&1_u16.to_be_bytes()); // ANCOUNT
    response.extend_from_slice(&0_u16.to_be_bytes()); // NSCOUNT
    response.extend_from_slice(&0_u16.to_be_bytes()); // ARCOUNT
    response.extend_from_slice(&query[HEADER_LEN..question_end]);

    // Single A answer pointing back at the question name.
    response.extend_from_slice(&0xC00C_u16.to_be_bytes());
    response.extend_from_slice(&1_u16.to_be_bytes()); // TYPE A
    response.extend_from_slice(&1_u16.to_be_bytes()); // CLASS IN
    response.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    response.extend_from_slice(&4_u16.to_be_bytes());
    response.extend_from_slice(&ip);

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn query_for(name: &str) -> Vec<u8> {
        let mut packet = vec![
            0xAB, 0xCD, // id
            0x01, 0x00, // standard query, RD set
            0x00, 0x01, // QDCOUNT
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
        packet
    }

    #[test]
    fn answers_a_query_with_portal_address() {
        let query = query_for("connectivitycheck.gstatic.com");
        let response = answer_query(&query, [192, 168, 4, 1]).expect("response");

        // Transaction id echoed, response + authoritative + RD flags.
        assert_eq!(&response[0..2], &[0xAB, 0xCD]);
        assert_eq!(&response[2..4], &[0x85, 0x00]);
        // One question, one answer.
        assert_eq!(&response[4..8], &[0x00, 0x01, 0x00, 0x01]);
        // The answer ends with rdlength 4 and the portal address.
        assert_eq!(&response[response.len() - 6..], &[0, 4, 192, 168, 4, 1]);
    }

    #[test]
    fn question_is_echoed_verbatim() {
        let query = query_for("example.com");
        let response = answer_query(&query, [10, 0, 0, 1]).expect("response");

        assert_eq!(&response[12..query.len()], &query[12..]);
    }

    #[test]
    fn non_query_packets_are_dropped() {
        let mut response_packet = query_for("example.com");
        response_packet[2] |= 0x80;

        assert_eq!(answer_query(&response_packet, [10, 0, 0, 1]), None);
    }

    #[test]
    fn truncated_packets_are_dropped() {
        let query = query_for("example.com");

        assert_eq!(answer_query(&query[..8], [10, 0, 0, 1]), None);
        assert_eq!(answer_query(&query[..query.len() - 3], [10, 0, 0, 1]), None);
    }

    #[test]
    fn zero_question_packets_are_dropped() {
        let mut query = query_for("example.com");
        query[4] = 0;
        query[5] = 0;

        assert_eq!(answer_query(&query, [10, 0, 0, 1]), None);
    }
}
