// Zone master file parsing and rendering of stored zones

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use trust_dns_proto::rr::rdata::{self, MX, SOA, SRV, TXT};
use trust_dns_proto::rr::{Name, RData, Record};

use super::{Zone, ZoneInfo, ZoneRetriever};
use crate::error::{NetworkError, NetworkResult};
use crate::sync::dns::{DnsRecord, ZoneRecord};
use crate::sync::ZoneStore;

/// TTL used when neither `$TTL` nor an earlier record set one.
const DEFAULT_TTL: u32 = 3600;

// SOA timers of rendered zones
const SOA_REFRESH: i32 = 120;
const SOA_RETRY: i32 = 60;
const SOA_EXPIRE: i32 = 86400;
const SOA_MINIMUM: u32 = 30;

/// One logical zone file entry, with parenthesised continuations folded in.
#[derive(Debug)]
struct Entry {
    line: usize,
    inherit_owner: bool,
    tokens: Vec<String>,
}

fn zone_error(line: usize, msg: impl std::fmt::Display) -> NetworkError {
    NetworkError::Dns(format!("zone line {}: {}", line, msg))
}

/// Splits a physical line into tokens, returning the number of opening and
/// closing parentheses seen outside quotes.
fn tokenize(raw: &str, line: usize) -> NetworkResult<(Vec<String>, usize, usize)> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut opens = 0;
    let mut closes = 0;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if in_quote {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                '"' => {
                    in_quote = false;
                    tokens.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
            continue;
        }

        match c {
            ';' => break,
            '"' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quote = true;
            }
            '(' | ')' => {
                if c == '(' {
                    opens += 1;
                } else {
                    closes += 1;
                }
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if in_quote {
        return Err(zone_error(line, "unterminated quoted string"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    Ok((tokens, opens, closes))
}

fn entries(content: &str) -> NetworkResult<Vec<Entry>> {
    let mut out = Vec::new();
    let mut pending: Option<Entry> = None;
    let mut depth = 0usize;
    let mut last_line = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        last_line = line;
        let (tokens, opens, closes) = tokenize(raw, line)?;

        match pending.as_mut() {
            Some(entry) => entry.tokens.extend(tokens),
            None if tokens.is_empty() && opens == 0 => continue,
            None => {
                pending = Some(Entry {
                    line,
                    inherit_owner: raw.starts_with(|c: char| c == ' ' || c == '\t'),
                    tokens,
                })
            }
        }

        depth = (depth + opens)
            .checked_sub(closes)
            .ok_or_else(|| zone_error(line, "unbalanced ')'"))?;

        if depth == 0 {
            if let Some(entry) = pending.take() {
                if !entry.tokens.is_empty() {
                    out.push(entry);
                }
            }
        }
    }

    if depth != 0 {
        return Err(zone_error(last_line, "unclosed '('"));
    }

    Ok(out)
}

fn fqdn(name: &str) -> NetworkResult<Name> {
    let name = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    };
    Ok(Name::from_ascii(name)?)
}

fn resolve_name(token: &str, origin: &Name, line: usize) -> NetworkResult<Name> {
    if token == "@" {
        return Ok(origin.clone());
    }
    Name::parse(token, Some(origin)).map_err(|e| zone_error(line, format!("invalid name {:?}: {}", token, e)))
}

fn field<T: FromStr>(fields: &[String], idx: usize, what: &str, line: usize) -> NetworkResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw = fields
        .get(idx)
        .ok_or_else(|| zone_error(line, format!("missing {}", what)))?;
    raw.parse::<T>()
        .map_err(|e| zone_error(line, format!("invalid {} {:?}: {}", what, raw, e)))
}

fn expect_fields(fields: &[String], count: usize, rtype: &str, line: usize) -> NetworkResult<()> {
    if fields.len() != count {
        return Err(zone_error(
            line,
            format!("{} record takes {} fields, got {}", rtype, count, fields.len()),
        ));
    }
    Ok(())
}

fn build_rdata(rtype: &str, fields: &[String], origin: &Name, line: usize) -> NetworkResult<RData> {
    let name_at = |idx: usize| -> NetworkResult<Name> {
        let token = fields
            .get(idx)
            .ok_or_else(|| zone_error(line, "missing name"))?;
        resolve_name(token, origin, line)
    };

    let rdata = match rtype {
        "A" => {
            expect_fields(fields, 1, rtype, line)?;
            RData::A(rdata::A::from(field::<Ipv4Addr>(fields, 0, "address", line)?))
        }
        "AAAA" => {
            expect_fields(fields, 1, rtype, line)?;
            RData::AAAA(rdata::AAAA::from(field::<Ipv6Addr>(fields, 0, "address", line)?))
        }
        "CNAME" => {
            expect_fields(fields, 1, rtype, line)?;
            RData::CNAME(rdata::CNAME(name_at(0)?))
        }
        "NS" => {
            expect_fields(fields, 1, rtype, line)?;
            RData::NS(rdata::NS(name_at(0)?))
        }
        "PTR" => {
            expect_fields(fields, 1, rtype, line)?;
            RData::PTR(rdata::PTR(name_at(0)?))
        }
        "TXT" => {
            if fields.is_empty() {
                return Err(zone_error(line, "TXT record needs at least one string"));
            }
            RData::TXT(TXT::new(fields.to_vec()))
        }
        "MX" => {
            expect_fields(fields, 2, rtype, line)?;
            RData::MX(MX::new(field(fields, 0, "preference", line)?, name_at(1)?))
        }
        "SRV" => {
            expect_fields(fields, 4, rtype, line)?;
            RData::SRV(SRV::new(
                field(fields, 0, "priority", line)?,
                field(fields, 1, "weight", line)?,
                field(fields, 2, "port", line)?,
                name_at(3)?,
            ))
        }
        "SOA" => {
            expect_fields(fields, 7, rtype, line)?;
            RData::SOA(SOA::new(
                name_at(0)?,
                name_at(1)?,
                field(fields, 2, "serial", line)?,
                field(fields, 3, "refresh", line)?,
                field(fields, 4, "retry", line)?,
                field(fields, 5, "expire", line)?,
                field(fields, 6, "minimum", line)?,
            ))
        }
        other => return Err(zone_error(line, format!("unsupported record type {}", other))),
    };

    Ok(rdata)
}

/// Parses zone master file text into resource records, in file order.
///
/// `origin` is the initial `$ORIGIN`; relative owner and target names are
/// completed against the current origin. Only the `IN` class is accepted.
pub fn parse_zone(content: &str, origin: &str) -> NetworkResult<Vec<Record>> {
    let mut origin = fqdn(origin)?;
    let mut default_ttl: Option<u32> = None;
    let mut last_ttl = DEFAULT_TTL;
    let mut last_owner: Option<Name> = None;
    let mut records = Vec::new();

    for entry in entries(content)? {
        let line = entry.line;
        let tokens = &entry.tokens;

        if tokens[0].starts_with('$') {
            let value = tokens
                .get(1)
                .ok_or_else(|| zone_error(line, format!("{} needs a value", tokens[0])))?;
            match tokens[0].to_ascii_uppercase().as_str() {
                "$ORIGIN" => origin = resolve_name(value, &origin, line)?,
                "$TTL" => default_ttl = Some(field(tokens, 1, "TTL", line)?),
                other => return Err(zone_error(line, format!("unsupported directive {}", other))),
            }
            continue;
        }

        let mut idx = 0;
        let owner = if entry.inherit_owner {
            last_owner
                .clone()
                .ok_or_else(|| zone_error(line, "record without owner name"))?
        } else {
            idx += 1;
            resolve_name(&tokens[0], &origin, line)?
        };

        let mut ttl = None;
        for _ in 0..2 {
            let Some(token) = tokens.get(idx) else { break };
            if token.eq_ignore_ascii_case("IN") {
                idx += 1;
            } else if let Ok(value) = token.parse::<u32>() {
                ttl = Some(value);
                idx += 1;
            } else if matches!(token.to_ascii_uppercase().as_str(), "CH" | "HS" | "CS") {
                return Err(zone_error(line, format!("unsupported class {}", token)));
            } else {
                break;
            }
        }

        let rtype = tokens
            .get(idx)
            .ok_or_else(|| zone_error(line, "missing record type"))?
            .to_ascii_uppercase();
        let rdata = build_rdata(&rtype, &tokens[idx + 1..], &origin, line)?;

        let ttl = match ttl {
            Some(ttl) => {
                last_ttl = ttl;
                ttl
            }
            None => default_ttl.unwrap_or(last_ttl),
        };

        records.push(Record::from_rdata(owner.clone(), ttl, rdata));
        last_owner = Some(owner);
    }

    Ok(records)
}

fn absolute(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Renders a stored zone as master file text, bracketed by its SOA as a
/// zone transfer expects.
pub fn render_zone(zone: &ZoneRecord, records: &[DnsRecord], serial: u32) -> String {
    let origin = absolute(&zone.name);
    let nameservers: Vec<String> = zone
        .config
        .get("dns.nameservers")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(absolute)
                .collect()
        })
        .unwrap_or_default();

    let primary = nameservers
        .first()
        .cloned()
        .unwrap_or_else(|| format!("ns1.{}", origin));
    let soa = format!(
        "@ IN SOA {} hostmaster.{} {} {} {} {} {}\n",
        primary, origin, serial, SOA_REFRESH, SOA_RETRY, SOA_EXPIRE, SOA_MINIMUM
    );

    let mut out = format!("$ORIGIN {}\n$TTL {}\n", origin, SOA_EXPIRE / 24);
    out.push_str(&soa);
    for ns in &nameservers {
        out.push_str(&format!("@ IN NS {}\n", ns));
    }

    for record in records {
        let rtype = record.record_type.to_ascii_uppercase();
        let value = if rtype == "TXT" && !record.value.starts_with('"') {
            format!("\"{}\"", record.value.replace('\\', "\\\\").replace('"', "\\\""))
        } else {
            record.value.clone()
        };
        let name = if record.name.is_empty() { "@" } else { record.name.as_str() };
        out.push_str(&format!("{} {} IN {} {}\n", name, record.ttl, rtype, value));
    }

    out.push_str(&soa);
    out
}

/// Serves zones kept in the config store.
pub struct StoreZoneRetriever {
    store: Arc<ZoneStore>,
}

impl StoreZoneRetriever {
    pub fn new(store: Arc<ZoneStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ZoneRetriever for StoreZoneRetriever {
    async fn zone(&self, name: &str) -> NetworkResult<Zone> {
        let record = self.store.get_zone(name).await?;
        let records = self.store.list_records(record.id).await?;
        let serial = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;

        Ok(Zone {
            content: render_zone(&record, &records, serial),
            info: ZoneInfo {
                name: record.name,
                config: record.config,
            },
        })
    }
}
