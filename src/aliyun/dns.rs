use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    aliyun::RpcClient,
    challenge::DnsProvider,
    config::Credentials,
    error::{Error, Result},
};

const ENDPOINT: &str = "https://alidns.aliyuncs.com/";
const VERSION: &str = "2015-01-09";

/// TTL of challenge records, in seconds.
pub const DEFAULT_TTL: u32 = 600;

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDomainsResponse {
    total_count: u32,
    domains: DomainList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainList {
    #[serde(default)]
    domain: Vec<HostedDomain>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedDomain {
    domain_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubDomainRecordsResponse {
    domain_records: RecordList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordList {
    #[serde(default)]
    record: Vec<Record>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Record {
    record_id: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordResponse {
    record_id: String,
}

/// Picks the hosted zone `name` belongs to, preferring the most specific one.
fn pick_zone<'a>(name: &str, zones: &'a [String]) -> Option<&'a str> {
    zones
        .iter()
        .map(String::as_str)
        .filter(|zone| {
            name.eq_ignore_ascii_case(zone)
                || name
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", zone.to_ascii_lowercase()))
        })
        .max_by_key(|zone| zone.len())
}

/// Host record of `name` relative to `zone`, `@` for the apex.
fn relative_name(name: &str, zone: &str) -> String {
    if name.len() <= zone.len() {
        return "@".to_owned();
    }

    name[..name.len() - zone.len() - 1].to_owned()
}

/// [`DnsProvider`] backed by Alibaba Cloud DNS.
#[derive(Debug)]
pub struct AliDns {
    rpc: RpcClient,
    ttl: u32,
}

impl AliDns {
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::with_endpoint(ENDPOINT, credentials)
    }

    pub fn with_endpoint(endpoint: &str, credentials: Credentials) -> Result<Self> {
        Ok(AliDns {
            rpc: RpcClient::new(endpoint, VERSION, credentials)?,
            ttl: DEFAULT_TTL,
        })
    }

    async fn hosted_zones(&self) -> Result<Vec<String>> {
        let mut zones = Vec::new();
        let mut page = 1u32;

        loop {
            let page_number = page.to_string();
            let page_size = PAGE_SIZE.to_string();

            let res: DescribeDomainsResponse = self
                .rpc
                .call(
                    "DescribeDomains",
                    &[("PageNumber", page_number.as_str()), ("PageSize", page_size.as_str())],
                )
                .await?;

            let fetched = res.domains.domain.len();
            zones.extend(res.domains.domain.into_iter().map(|d| d.domain_name));

            if fetched == 0 || zones.len() >= res.total_count as usize {
                return Ok(zones);
            }

            page += 1;
        }
    }

    async fn zone_for(&self, name: &str) -> Result<String> {
        let zones = self.hosted_zones().await?;

        let zone = pick_zone(name, &zones).ok_or_else(|| {
            Error::Config(format!("no Alibaba Cloud DNS zone hosts {name}"))
        })?;

        log::debug!("{name} is hosted in zone {zone}");
        Ok(zone.to_owned())
    }
}

#[async_trait]
impl DnsProvider for AliDns {
    async fn upsert_txt_record(&self, name: &str, value: &str) -> Result<String> {
        let zone = self.zone_for(name).await?;
        let rr = relative_name(name, &zone);
        let ttl = self.ttl.to_string();

        let existing: DescribeSubDomainRecordsResponse = self
            .rpc
            .call(
                "DescribeSubDomainRecords",
                &[("SubDomain", name), ("Type", "TXT")],
            )
            .await?;

        let records = existing.domain_records.record;

        if let Some(record) = records.iter().find(|record| record.value == value) {
            log::debug!("TXT record {name} already holds the value");
            return Ok(record.record_id.clone());
        }

        let res: RecordResponse = match records.first() {
            Some(record) => {
                self.rpc
                    .call(
                        "UpdateDomainRecord",
                        &[
                            ("RecordId", record.record_id.as_str()),
                            ("RR", rr.as_str()),
                            ("Type", "TXT"),
                            ("Value", value),
                            ("TTL", ttl.as_str()),
                        ],
                    )
                    .await?
            }
            None => {
                self.rpc
                    .call(
                        "AddDomainRecord",
                        &[
                            ("DomainName", zone.as_str()),
                            ("RR", rr.as_str()),
                            ("Type", "TXT"),
                            ("Value", value),
                            ("TTL", ttl.as_str()),
                        ],
                    )
                    .await?
            }
        };

        Ok(res.record_id)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let _: RecordResponse = self
            .rpc
            .call("DeleteDomainRecord", &[("RecordId", record_id)])
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aliyun::{sign, string_to_sign},
        test::with_rpc_server,
    };

    const PROOF: &str = "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0";

    fn hosted(action: &str) -> Option<(u16, &'static str)> {
        match action {
            "DescribeDomains" => Some((
                200,
                r#"{
                    "TotalCount": 2,
                    "Domains": { "Domain": [
                        { "DomainName": "example.com" },
                        { "DomainName": "example.org" }
                    ] }
                }"#,
            )),
            "AddDomainRecord" | "UpdateDomainRecord" | "DeleteDomainRecord" => Some((
                200,
                r#"{ "RequestId": "536E9CAD", "RecordId": "9999985" }"#,
            )),
            _ => None,
        }
    }

    fn no_records(action: &str) -> (u16, &'static str) {
        hosted(action).unwrap_or((
            200,
            r#"{ "TotalCount": 0, "DomainRecords": { "Record": [] } }"#,
        ))
    }

    fn stale_record(action: &str) -> (u16, &'static str) {
        hosted(action).unwrap_or((
            200,
            r#"{ "TotalCount": 1, "DomainRecords": { "Record": [
                { "RecordId": "9999985", "RR": "_acme-challenge", "Type": "TXT", "Value": "stale" }
            ] } }"#,
        ))
    }

    fn current_record(action: &str) -> (u16, &'static str) {
        hosted(action).unwrap_or((
            200,
            r#"{ "TotalCount": 1, "DomainRecords": { "Record": [
                { "RecordId": "1234", "RR": "_acme-challenge", "Type": "TXT",
                  "Value": "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0" }
            ] } }"#,
        ))
    }

    fn client(server: &crate::test::RpcServer) -> AliDns {
        AliDns::with_endpoint(&server.url, Credentials::new("testid", "testsecret")).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_adds_missing_record() {
        let server = with_rpc_server(no_records);
        let dns = client(&server);

        let id = dns
            .upsert_txt_record("_acme-challenge.example.com", PROOF)
            .await
            .unwrap();
        assert_eq!(id, "9999985");

        assert_eq!(
            server.actions(),
            ["DescribeDomains", "DescribeSubDomainRecords", "AddDomainRecord"]
        );

        let mut add = server.requests().pop().unwrap();
        assert_eq!(add["DomainName"], "example.com");
        assert_eq!(add["RR"], "_acme-challenge");
        assert_eq!(add["Type"], "TXT");
        assert_eq!(add["Value"], PROOF);
        assert_eq!(add["TTL"], "600");

        let signature = add.remove("Signature").unwrap();
        assert_eq!(
            signature,
            sign("testsecret", &string_to_sign("POST", &add)).unwrap()
        );
    }

    #[tokio::test]
    async fn test_upsert_overwrites_stale_record() {
        let server = with_rpc_server(stale_record);
        let dns = client(&server);

        let id = dns
            .upsert_txt_record("_acme-challenge.example.com", PROOF)
            .await
            .unwrap();
        assert_eq!(id, "9999985");

        let update = server.requests().pop().unwrap();
        assert_eq!(update["Action"], "UpdateDomainRecord");
        assert_eq!(update["RecordId"], "9999985");
        assert_eq!(update["Value"], PROOF);
    }

    #[tokio::test]
    async fn test_upsert_reuses_current_record() {
        let server = with_rpc_server(current_record);
        let dns = client(&server);

        let id = dns
            .upsert_txt_record("_acme-challenge.example.com", PROOF)
            .await
            .unwrap();

        assert_eq!(id, "1234");
        assert_eq!(server.actions(), ["DescribeDomains", "DescribeSubDomainRecords"]);
    }

    #[tokio::test]
    async fn test_upsert_outside_hosted_zones() {
        let server = with_rpc_server(no_records);
        let dns = client(&server);

        let err = dns
            .upsert_txt_record("_acme-challenge.example.net", PROOF)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(server.actions(), ["DescribeDomains"]);
    }

    #[tokio::test]
    async fn test_delete_record() {
        let server = with_rpc_server(no_records);
        client(&server).delete_record("9999985").await.unwrap();

        let delete = server.requests().pop().unwrap();
        assert_eq!(delete["Action"], "DeleteDomainRecord");
        assert_eq!(delete["RecordId"], "9999985");
    }

    fn zones(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn test_pick_zone_prefers_longest_suffix() {
        let hosted = zones(&["example.com", "cdn.example.com", "ample.com"]);

        assert_eq!(
            pick_zone("_acme-challenge.www.cdn.example.com", &hosted),
            Some("cdn.example.com")
        );
        assert_eq!(
            pick_zone("_acme-challenge.example.com", &hosted),
            Some("example.com")
        );
        assert_eq!(pick_zone("_acme-challenge.example.org", &hosted), None);
    }

    #[test]
    fn test_relative_name() {
        assert_eq!(
            relative_name("_acme-challenge.www.example.com", "example.com"),
            "_acme-challenge.www"
        );
        assert_eq!(relative_name("example.com", "example.com"), "@");
    }

    #[test]
    fn test_parse_sub_domain_records() {
        let res: DescribeSubDomainRecordsResponse = serde_json::from_str(
            r#"{
                "RequestId": "536E9CAD-DB30-4647-AC87-AA5CC38C5382",
                "TotalCount": 1,
                "PageNumber": 1,
                "PageSize": 20,
                "DomainRecords": {
                    "Record": [{
                        "DomainName": "example.com",
                        "RecordId": "9999985",
                        "RR": "_acme-challenge",
                        "Type": "TXT",
                        "Value": "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0",
                        "TTL": 600,
                        "Line": "default",
                        "Status": "Enable",
                        "Locked": false
                    }]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(res.domain_records.record.len(), 1);
        assert_eq!(res.domain_records.record[0].record_id, "9999985");
    }

    #[test]
    fn test_parse_empty_domain_list() {
        let res: DescribeDomainsResponse = serde_json::from_str(
            r#"{ "RequestId": "x", "TotalCount": 0, "Domains": { "Domain": [] } }"#,
        )
        .unwrap();

        assert_eq!(res.total_count, 0);
        assert!(res.domains.domain.is_empty());
    }
}
