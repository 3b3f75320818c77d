use std::ops::Range;

/// A span of telegram bytes together with a human readable meaning.
///
/// Offsets are relative to [`Telegram::parsed`], i.e. the header bytes
/// consumed by the link layer followed by the working content.
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub offset: usize,
    pub len: usize,
    pub info: String,
}

/// One received wM-Bus telegram.
///
/// Built by the link layer, then mutated in place by every meter driver that
/// accepts it (content populated, explanations appended).
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    /// Meter id as printed on the device, eg. "12345678"
    pub id: String,
    pub m_field: u16,
    /// Address bytes in wire order (least significant first)
    pub a_field_address: [u8; 4],
    pub a_field_version: u8,
    pub a_field_device_type: u8,
    pub ci_field: u8,
    pub access_number: u8,
    pub encrypted: bool,
    /// Number of encrypted 16 byte blocks at the start of the payload, None = all of it
    pub num_encrypted_blocks: Option<usize>,
    pub simulated: bool,
    pub payload: Vec<u8>,
    pub content: Vec<u8>,
    /// Header bytes consumed so far, followed by the content once populated
    pub parsed: Vec<u8>,
    pub header_len: usize,
    pub explanations: Vec<Explanation>,
}

impl Telegram {
    pub fn new(m_field: u16, a_field_address: [u8; 4], version: u8, device_type: u8, payload: Vec<u8>) -> Self {
        Telegram {
            id: format_id(&a_field_address),
            m_field,
            a_field_address,
            a_field_version: version,
            a_field_device_type: device_type,
            ci_field: 0x78,
            access_number: 0,
            encrypted: false,
            num_encrypted_blocks: None,
            simulated: false,
            payload,
            content: Vec::new(),
            parsed: Vec::new(),
            header_len: 0,
            explanations: Vec::new(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Address in wire order, as the radio sends it.
    pub fn address_hex(&self) -> String {
        hex::encode(self.a_field_address)
    }

    /// Record the link layer header. Must happen before any content is set.
    pub fn set_header(&mut self, header: &[u8]) {
        self.parsed = header.to_vec();
        self.header_len = header.len();
        self.content.clear();
        self.explanations.clear();
    }

    /// Drop content and content explanations left behind by a previous driver.
    pub fn reset_content(&mut self) {
        let header_len = self.header_len;
        self.content.clear();
        self.parsed.truncate(header_len);
        self.explanations.retain(|e| e.offset < header_len);
    }

    /// Store the working content and append it to the parse log.
    /// Returns the range the content occupies in [`Telegram::parsed`].
    pub fn set_content(&mut self, content: Vec<u8>) -> Range<usize> {
        self.reset_content();
        let start = self.parsed.len();
        self.parsed.extend_from_slice(&content);
        self.content = content;
        start..self.parsed.len()
    }

    pub fn content_start(&self) -> usize {
        self.header_len
    }

    pub fn add_explanation(&mut self, offset: usize, len: usize, info: impl Into<String>) {
        self.explanations.push(Explanation { offset, len, info: info.into() });
    }

    /// Append text to the explanation starting at `offset`, creating one if needed.
    pub fn add_more_explanation(&mut self, offset: usize, info: impl AsRef<str>) {
        match self.explanations.iter_mut().find(|e| e.offset == offset) {
            Some(e) => e.info.push_str(info.as_ref()),
            None => self.add_explanation(offset, 1, info.as_ref().trim_start()),
        }
    }

    pub fn header_hex(&self) -> String {
        hex::encode(&self.parsed[..self.header_len.min(self.parsed.len())])
    }

    pub fn content_hex(&self) -> String {
        hex::encode(&self.content)
    }

    /// Render the explanations from `from` onwards, one line per span.
    pub fn explain_parse(&self, prefix: &str, from: usize) -> String {
        let mut explanations: Vec<&Explanation> = self.explanations.iter().filter(|e| e.offset >= from).collect();
        explanations.sort_by_key(|e| e.offset);

        let mut out = String::new();
        for e in explanations {
            let end = (e.offset + e.len).min(self.parsed.len());
            let bytes = self.parsed.get(e.offset..end).unwrap_or(&[]);
            out.push_str(&format!("{prefix} {:03}: {} {}\n", e.offset, hex::encode_upper(bytes), e.info));
        }
        out
    }
}

/// Print the meter id most significant byte first, the way it is written on the meter.
pub fn format_id(address: &[u8; 4]) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", address[3], address[2], address[1], address[0])
}
