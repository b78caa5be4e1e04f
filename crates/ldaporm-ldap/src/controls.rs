//! BER codecs for the search controls the engine uses
//!
//! Paged results (RFC 2696) goes through ldap3's own control type. Server-side
//! sort (RFC 2891) and virtual list view (draft-ietf-ldapext-ldapv3-vlv) are
//! encoded with ldap3's ASN.1 structures. Response values are decoded without
//! panicking on malformed input.

use bytes::BytesMut;
use ldap3::asn1::{
    parse_tag, write, ASNTag, Boolean, Integer, OctetString, Sequence, StructureTag, Tag,
    TagClass, PL,
};
use ldap3::controls::{Control, PagedResults, RawControl};

use ldaporm_core::error::{DirectoryError, DirectoryResult, ResultCode};
use ldaporm_core::operation::{
    ResponseControl, SearchControl, SortKey, VlvRequest, VlvTarget, PAGED_RESULTS_OID,
    SORT_REQUEST_OID, SORT_RESPONSE_OID, VLV_REQUEST_OID, VLV_RESPONSE_OID,
};

/// Largest count accepted in a BER INTEGER we emit.
const MAX_INT: u32 = i32::MAX as u32;

fn encode(tag: Tag) -> DirectoryResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, tag.into_structure())
        .map_err(|e| DirectoryError::control_encoding(format!("BER encoding failed: {e}")))?;
    Ok(buf.to_vec())
}

fn integer(value: u32, what: &str) -> DirectoryResult<Tag> {
    if value > MAX_INT {
        return Err(DirectoryError::control_encoding(format!(
            "{what} {value} exceeds maxInt"
        )));
    }
    Ok(Tag::Integer(Integer {
        inner: i64::from(value),
        ..Default::default()
    }))
}

/// Encode the server-side sort request value.
pub fn encode_sort_request(keys: &[SortKey]) -> DirectoryResult<Vec<u8>> {
    if keys.is_empty() {
        return Err(DirectoryError::control_encoding(
            "sort request needs at least one key",
        ));
    }
    let mut inner = Vec::with_capacity(keys.len());
    for key in keys {
        if key.attribute.is_empty() {
            return Err(DirectoryError::control_encoding("empty sort attribute"));
        }
        let mut parts = vec![Tag::OctetString(OctetString {
            inner: key.attribute.as_bytes().to_vec(),
            ..Default::default()
        })];
        if key.reverse {
            parts.push(Tag::Boolean(Boolean {
                class: TagClass::Context,
                id: 1,
                inner: true,
            }));
        }
        inner.push(Tag::Sequence(Sequence {
            inner: parts,
            ..Default::default()
        }));
    }
    encode(Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    }))
}

/// Encode the virtual list view request value.
pub fn encode_vlv_request(request: &VlvRequest) -> DirectoryResult<Vec<u8>> {
    let target = match &request.target {
        VlvTarget::ByOffset {
            offset,
            content_count,
        } => {
            if *offset == 0 {
                return Err(DirectoryError::control_encoding(
                    "VLV offsets are 1-based, got 0",
                ));
            }
            Tag::Sequence(Sequence {
                class: TagClass::Context,
                id: 0,
                inner: vec![
                    integer(*offset, "offset")?,
                    integer(*content_count, "content count")?,
                ],
            })
        }
        VlvTarget::GreaterThanOrEqual(value) => Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: 1,
            inner: value.clone(),
        }),
    };

    let mut inner = vec![
        integer(request.before_count, "before count")?,
        integer(request.after_count, "after count")?,
        target,
    ];
    if let Some(context) = &request.context_id {
        inner.push(Tag::OctetString(OctetString {
            inner: context.clone(),
            ..Default::default()
        }));
    }
    encode(Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    }))
}

/// Build the ldap3 request control for a search control.
pub fn to_raw_control(control: &SearchControl) -> DirectoryResult<RawControl> {
    match control {
        SearchControl::Paged { size, cookie } => {
            let size = i32::try_from(*size).map_err(|_| {
                DirectoryError::control_encoding(format!("page size {size} exceeds maxInt"))
            })?;
            Ok(PagedResults {
                size,
                cookie: cookie.clone(),
            }
            .into())
        }
        SearchControl::Sort { keys } => Ok(RawControl {
            ctype: SORT_REQUEST_OID.to_string(),
            crit: true,
            val: Some(encode_sort_request(keys)?),
        }),
        SearchControl::VirtualListView(request) => Ok(RawControl {
            ctype: VLV_REQUEST_OID.to_string(),
            crit: true,
            val: Some(encode_vlv_request(request)?),
        }),
    }
}

fn malformed(what: &str) -> DirectoryError {
    DirectoryError::protocol(
        ResultCode::PROTOCOL_ERROR,
        format!("malformed {what} response control"),
    )
}

fn sequence(val: &[u8], what: &str) -> DirectoryResult<Vec<StructureTag>> {
    match parse_tag(val) {
        Ok((_, tag)) => match tag.payload {
            PL::C(inner) => Ok(inner),
            PL::P(_) => Err(malformed(what)),
        },
        Err(_) => Err(malformed(what)),
    }
}

fn primitive<'a>(tag: Option<&'a StructureTag>, what: &str) -> DirectoryResult<&'a [u8]> {
    match tag.map(|t| &t.payload) {
        Some(PL::P(bytes)) => Ok(bytes.as_slice()),
        _ => Err(malformed(what)),
    }
}

fn unsigned(bytes: &[u8], what: &str) -> DirectoryResult<u32> {
    if bytes.is_empty() || bytes.len() > 5 {
        return Err(malformed(what));
    }
    let value = bytes
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    u32::try_from(value).map_err(|_| malformed(what))
}

/// Decode the paged results response value.
pub fn decode_paged_response(val: &[u8]) -> DirectoryResult<ResponseControl> {
    let parts = sequence(val, "paged results")?;
    let size = unsigned(primitive(parts.first(), "paged results")?, "paged results")?;
    let cookie = primitive(parts.get(1), "paged results")?.to_vec();
    Ok(ResponseControl::Paged { size, cookie })
}

/// Decode the server-side sort response value.
pub fn decode_sort_response(val: &[u8]) -> DirectoryResult<ResponseControl> {
    let parts = sequence(val, "sort")?;
    let result = unsigned(primitive(parts.first(), "sort")?, "sort")?;
    let attribute = match parts.get(1) {
        Some(tag) => Some(String::from_utf8_lossy(primitive(Some(tag), "sort")?).into_owned()),
        None => None,
    };
    Ok(ResponseControl::Sort {
        result: ResultCode(result),
        attribute,
    })
}

/// Decode the virtual list view response value.
pub fn decode_vlv_response(val: &[u8]) -> DirectoryResult<ResponseControl> {
    let parts = sequence(val, "VLV")?;
    let target_position = unsigned(primitive(parts.first(), "VLV")?, "VLV")?;
    let content_count = unsigned(primitive(parts.get(1), "VLV")?, "VLV")?;
    let result = unsigned(primitive(parts.get(2), "VLV")?, "VLV")?;
    let context_id = match parts.get(3) {
        Some(tag) => Some(primitive(Some(tag), "VLV")?.to_vec()),
        None => None,
    };
    Ok(ResponseControl::VirtualListView {
        target_position,
        content_count,
        result: ResultCode(result),
        context_id,
    })
}

/// Decode the response controls the engine understands, skipping the rest.
pub fn from_response_controls(ctrls: &[Control]) -> DirectoryResult<Vec<ResponseControl>> {
    let mut decoded = Vec::new();
    for Control(_, raw) in ctrls {
        let Some(val) = raw.val.as_deref() else {
            continue;
        };
        match raw.ctype.as_str() {
            PAGED_RESULTS_OID => decoded.push(decode_paged_response(val)?),
            SORT_RESPONSE_OID => decoded.push(decode_sort_response(val)?),
            VLV_RESPONSE_OID => decoded.push(decode_vlv_response(val)?),
            _ => {}
        }
    }
    Ok(decoded)
}
