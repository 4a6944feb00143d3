//! Virtual network planning and provisioning
//!
//! The planning half is pure: CIDR selection, per-zone subnet layout and
//! public/private classification. The provisioning half (stage 6) creates a
//! fresh network or repairs an existing one so the load balancer and the
//! instance have the subnets, routes and security groups they need.

use crate::error::Result;
use crate::provision::{NetworkLayout, Provisioner, attr_of, id_of};
use agentstack_cloud::{
    CloudError, IngressRule, NetworkSnapshot, ResourceKind, ResourceSpec, RouteTarget, Setting,
    SubnetInfo, TerminalStates,
};
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Address blocks tried in order for a new VPC
const CANDIDATE_CIDRS: [&str; 8] = [
    "10.20.0.0/16",
    "10.21.0.0/16",
    "10.22.0.0/16",
    "10.23.0.0/16",
    "10.24.0.0/16",
    "172.16.0.0/16",
    "172.17.0.0/16",
    "172.18.0.0/16",
];
const FALLBACK_CIDR: &str = "10.25.0.0/16";
const EXTRA_CANDIDATE: &str = "192.168.0.0/16";

/// /24 indices tried when the preferred one is taken
const ALTERNATE_INDICES: std::ops::Range<u32> = 10..30;

const PUBLIC_OFFSET: u32 = 0;
const PRIVATE_OFFSET: u32 = 2;
const ZONES_USED: usize = 2;
const ANYWHERE: &str = "0.0.0.0/0";

/// First candidate block no existing VPC uses
pub fn pick_cidr(existing: &[String]) -> String {
    let taken: HashSet<&str> = existing.iter().map(String::as_str).collect();
    CANDIDATE_CIDRS
        .iter()
        .chain(std::iter::once(&EXTRA_CANDIDATE))
        .find(|cidr| !taken.contains(**cidr))
        .map(|cidr| cidr.to_string())
        .unwrap_or_else(|| FALLBACK_CIDR.to_string())
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let invalid = || CloudError::InvalidConfig(format!("invalid CIDR block: {}", cidr));
    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid().into());
    }
    Ok((address, prefix))
}

fn network_mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

/// The `index`-th /24 inside `vpc_cidr`
///
/// Past the end of the block the third octet is set to `index` directly,
/// which lets the provider reject it as out of range.
pub fn subnet_cidr(vpc_cidr: &str, index: u32) -> Result<String> {
    let (address, prefix) = parse_cidr(vpc_cidr)?;
    if prefix > 24 {
        return Err(CloudError::InvalidConfig(format!(
            "{} is too small for /24 subnets",
            vpc_cidr
        ))
        .into());
    }

    let available = 1u32 << (24 - prefix);
    if index < available {
        let base = u32::from(address) & network_mask(prefix);
        return Ok(format!("{}/24", Ipv4Addr::from(base + index * 256)));
    }
    let [a, b, ..] = address.octets();
    Ok(format!("{}.{}.{}.0/24", a, b, index))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubnet {
    pub zone: String,
    pub cidr: String,
}

/// One /24 per zone starting at `offset`, avoiding `existing`
///
/// A zone with no free block in the preferred or alternate positions is
/// skipped with a warning.
pub fn plan_subnets(
    vpc_cidr: &str,
    zones: &[String],
    offset: u32,
    existing: &HashSet<String>,
) -> Result<Vec<PlannedSubnet>> {
    let mut taken = existing.clone();
    let mut planned = Vec::with_capacity(zones.len());

    for (i, zone) in zones.iter().enumerate() {
        let preferred = subnet_cidr(vpc_cidr, offset + i as u32)?;
        let mut chosen = (!taken.contains(&preferred)).then_some(preferred);
        if chosen.is_none() {
            for alternate in ALTERNATE_INDICES {
                let candidate = subnet_cidr(vpc_cidr, alternate)?;
                if !taken.contains(&candidate) {
                    chosen = Some(candidate);
                    break;
                }
            }
        }

        match chosen {
            Some(cidr) => {
                taken.insert(cidr.clone());
                planned.push(PlannedSubnet {
                    zone: zone.clone(),
                    cidr,
                });
            }
            None => warn!("No available CIDR block in {}, skipping zone", zone),
        }
    }
    Ok(planned)
}

#[derive(Debug, Clone, Default)]
pub struct SubnetClassification {
    pub public: Vec<SubnetInfo>,
    pub private: Vec<SubnetInfo>,
}

/// Split subnets by name, then by whether their own route table reaches an
/// internet gateway
///
/// Only explicitly associated route tables count; a subnet that relies on the
/// main table is private.
pub fn classify_subnets(snapshot: &NetworkSnapshot, only_available: bool) -> SubnetClassification {
    let mut classification = SubnetClassification::default();

    for subnet in &snapshot.subnets {
        if only_available && subnet.state != "available" {
            continue;
        }

        let name = subnet.name.to_lowercase();
        let public = if name.contains("public") {
            true
        } else if name.contains("private") {
            false
        } else {
            snapshot
                .route_tables
                .iter()
                .find(|rt| rt.subnet_ids.iter().any(|s| s == &subnet.id))
                .is_some_and(|rt| rt.routes_to_internet_gateway())
        };

        if public {
            classification.public.push(subnet.clone());
        } else {
            classification.private.push(subnet.clone());
        }
    }
    classification
}

/// Load balancer subnets: at least two public subnets in two zones
pub fn validate_load_balancer_subnets(public: &[SubnetInfo]) -> Result<Vec<String>> {
    if public.len() < 2 {
        return Err(CloudError::Precondition(format!(
            "ALB requires at least 2 public subnets in different availability zones. \
             Found only {} public subnet(s)",
            public.len()
        ))
        .into());
    }

    let zones: BTreeSet<&str> = public.iter().map(|s| s.availability_zone.as_str()).collect();
    if zones.len() < 2 {
        return Err(CloudError::Precondition(format!(
            "ALB requires subnets in at least 2 different availability zones. \
             Found subnets only in: {}",
            zones.into_iter().collect::<Vec<_>>().join(", ")
        ))
        .into());
    }
    Ok(public.iter().map(|s| s.id.clone()).collect())
}

/// The provider refused the block because it overlaps or lies outside the VPC
fn is_block_rejected(err: &CloudError) -> bool {
    let message = err.to_string();
    ["InvalidSubnet.Overlap", "InvalidSubnet.Range", "InvalidSubnet.Conflict"]
        .iter()
        .any(|code| message.contains(code))
}

impl Provisioner<'_> {
    pub(crate) async fn network(&self) -> Result<NetworkLayout> {
        let run = &self.run;

        let (vpc_id, cidr, reused) = match self.find(ResourceKind::Vpc, &run.vpc_name()).await? {
            Some(existing) => {
                let vpc_id = id_of(&existing)?;
                info!("  Using existing VPC: {}", vpc_id);
                (vpc_id, attr_of(&existing, agentstack_cloud::attr::CIDR)?, true)
            }
            None => {
                let cidr = pick_cidr(&self.provider.existing_cidrs().await?);
                info!("  Using CIDR block: {}", cidr);
                let vpc = self
                    .ensure(ResourceSpec::Vpc {
                        name: run.vpc_name(),
                        cidr: cidr.clone(),
                    })
                    .await?
                    .into_descriptor();
                let vpc_id = id_of(&vpc)?;
                self.apply(Setting::VpcDnsSupport {
                    vpc_id: vpc_id.clone(),
                })
                .await?;
                (vpc_id, cidr, false)
            }
        };

        let mut zones = self.provider.availability_zones().await?;
        zones.truncate(ZONES_USED);
        debug!(?zones, "Availability zones");

        let gateway = self
            .ensure(ResourceSpec::InternetGateway {
                name: run.internet_gateway_name(),
                vpc_id: vpc_id.clone(),
            })
            .await?;
        let gateway_id = id_of(gateway.descriptor())?;

        let snapshot = self.provider.network_snapshot(&vpc_id).await?;
        let existing = classify_subnets(&snapshot, true);
        let mut taken: HashSet<String> = snapshot.subnets.iter().map(|s| s.cidr.clone()).collect();
        info!(
            "  Found {} public and {} private subnets",
            existing.public.len(),
            existing.private.len()
        );

        let mut public = existing.public;
        if public.is_empty() {
            public = self
                .public_subnets(&vpc_id, &cidr, &zones, &gateway_id, &mut taken)
                .await?;
        }

        let mut private = existing.private;
        if private.is_empty() {
            let nat_subnet = public.first().map(|s| s.id.clone()).ok_or_else(|| {
                CloudError::Precondition(format!(
                    "no public subnet in {} for the NAT gateway",
                    vpc_id
                ))
            })?;
            private = self
                .private_subnets(&vpc_id, &cidr, &zones, &nat_subnet, &mut taken)
                .await?;
        }

        if reused {
            self.repair_main_route(&snapshot, &gateway_id).await?;
        }

        let alb_security_group = self
            .ensure(ResourceSpec::SecurityGroup {
                name: run.alb_security_group_name(),
                vpc_id: vpc_id.clone(),
                description: "security group for alb".to_string(),
                ingress: vec![IngressRule::tcp_from_cidr(80, ANYWHERE, "HTTP")],
            })
            .await?;
        let alb_security_group = id_of(alb_security_group.descriptor())?;

        let compute_security_group = self
            .ensure(ResourceSpec::SecurityGroup {
                name: run.compute_security_group_name(),
                vpc_id: vpc_id.clone(),
                description: "Security group for ec2".to_string(),
                ingress: vec![
                    IngressRule::tcp_from_group(
                        run.app_port,
                        alb_security_group.as_str(),
                        "Application from ALB",
                    ),
                    IngressRule::tcp_from_cidr(443, cidr.as_str(), "HTTPS from VPC"),
                ],
            })
            .await?;
        let compute_security_group = id_of(compute_security_group.descriptor())?;

        let endpoint = self
            .ensure(ResourceSpec::VpcEndpoint {
                name: run.endpoint_name(),
                vpc_id: vpc_id.clone(),
                service_name: run.endpoint_service_name(),
                subnet_ids: private.iter().map(|s| s.id.clone()).collect(),
                security_group_ids: vec![compute_security_group.clone()],
            })
            .await?;

        Ok(NetworkLayout {
            vpc_id,
            cidr,
            public_subnets: public,
            private_subnets: private,
            alb_security_group,
            compute_security_group,
            endpoint_id: endpoint.into_descriptor().id,
            reused,
        })
    }

    /// Create one subnet, or `None` when the provider rejects its block
    async fn subnet(
        &self,
        name: String,
        vpc_id: &str,
        planned: &PlannedSubnet,
        public: bool,
    ) -> Result<Option<SubnetInfo>> {
        let spec = ResourceSpec::Subnet {
            name: name.clone(),
            vpc_id: vpc_id.to_string(),
            cidr: planned.cidr.clone(),
            availability_zone: planned.zone.clone(),
            public,
        };

        match self.ensure(spec).await {
            Ok(ensured) => Ok(Some(SubnetInfo {
                id: id_of(ensured.descriptor())?,
                name,
                cidr: planned.cidr.clone(),
                availability_zone: planned.zone.clone(),
                state: "available".to_string(),
                map_public_ip: public,
                ..Default::default()
            })),
            Err(err) if err.cloud().is_some_and(is_block_rejected) => {
                warn!(
                    "  Could not create subnet {} in {}: {}",
                    planned.cidr, planned.zone, err
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn public_subnets(
        &self,
        vpc_id: &str,
        cidr: &str,
        zones: &[String],
        gateway_id: &str,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<SubnetInfo>> {
        let run = &self.run;
        let route_table = self
            .ensure(ResourceSpec::RouteTable {
                name: run.public_route_table_name(),
                vpc_id: vpc_id.to_string(),
            })
            .await?;
        let route_table_id = id_of(route_table.descriptor())?;
        self.apply(Setting::Route {
            route_table_id: route_table_id.clone(),
            destination: ANYWHERE.to_string(),
            target: RouteTarget::InternetGateway(gateway_id.to_string()),
        })
        .await?;

        let mut created = Vec::new();
        for planned in plan_subnets(cidr, zones, PUBLIC_OFFSET, taken)? {
            let name = run.public_subnet_name(created.len() + 1);
            let Some(subnet) = self.subnet(name, vpc_id, &planned, true).await? else {
                continue;
            };
            taken.insert(planned.cidr);
            self.apply(Setting::SubnetPublicIp {
                subnet_id: subnet.id.clone(),
            })
            .await?;
            self.apply(Setting::RouteTableAssociation {
                route_table_id: route_table_id.clone(),
                subnet_id: subnet.id.clone(),
            })
            .await?;
            info!(
                "  ✓ Public subnet {} ({}) in {}",
                subnet.id, subnet.cidr, subnet.availability_zone
            );
            created.push(subnet);
        }
        Ok(created)
    }

    async fn private_subnets(
        &self,
        vpc_id: &str,
        cidr: &str,
        zones: &[String],
        nat_subnet: &str,
        taken: &mut HashSet<String>,
    ) -> Result<Vec<SubnetInfo>> {
        let run = &self.run;

        let nat = self
            .ensure(ResourceSpec::NatGateway {
                name: run.nat_gateway_name(),
                subnet_id: nat_subnet.to_string(),
            })
            .await?;
        let nat_id = id_of(nat.descriptor())?;
        info!("  Waiting for NAT gateway {} to be available", nat_id);
        self.await_status(
            ResourceKind::NatGateway,
            &nat_id,
            &self.timings.nat_gateway,
            &TerminalStates::available_or_failed(),
        )
        .await?;

        let route_table = self
            .ensure(ResourceSpec::RouteTable {
                name: run.private_route_table_name(),
                vpc_id: vpc_id.to_string(),
            })
            .await?;
        let route_table_id = id_of(route_table.descriptor())?;
        self.apply(Setting::Route {
            route_table_id: route_table_id.clone(),
            destination: ANYWHERE.to_string(),
            target: RouteTarget::NatGateway(nat_id),
        })
        .await?;

        let mut created = Vec::new();
        for (i, planned) in plan_subnets(cidr, zones, PRIVATE_OFFSET, taken)?
            .into_iter()
            .enumerate()
        {
            let name = run.private_subnet_name(i + 1);
            let Some(subnet) = self.subnet(name, vpc_id, &planned, false).await? else {
                continue;
            };
            taken.insert(planned.cidr);
            self.await_status(
                ResourceKind::Subnet,
                &subnet.id,
                &self.timings.subnet,
                &TerminalStates::available_or_failed(),
            )
            .await?;
            self.apply(Setting::RouteTableAssociation {
                route_table_id: route_table_id.clone(),
                subnet_id: subnet.id.clone(),
            })
            .await?;
            info!(
                "  ✓ Private subnet {} ({}) in {}",
                subnet.id, subnet.cidr, subnet.availability_zone
            );
            created.push(subnet);
        }
        Ok(created)
    }

    /// Give the main route table a default route through the gateway
    async fn repair_main_route(&self, snapshot: &NetworkSnapshot, gateway_id: &str) -> Result<()> {
        let Some(main) = snapshot.main_route_table() else {
            warn!("  No main route table found");
            return Ok(());
        };
        if main.has_default_internet_route() {
            debug!(route_table = %main.id, "Main route table already reaches the internet");
            return Ok(());
        }

        info!("  Adding internet gateway route to main route table {}", main.id);
        self.apply(Setting::Route {
            route_table_id: main.id.clone(),
            destination: ANYWHERE.to_string(),
            target: RouteTarget::InternetGateway(gateway_id.to_string()),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentstack_cloud::{RouteInfo, RouteTableInfo};

    fn subnet(id: &str, name: &str, zone: &str) -> SubnetInfo {
        SubnetInfo {
            id: id.into(),
            name: name.into(),
            cidr: String::new(),
            availability_zone: zone.into(),
            state: "available".into(),
            ..Default::default()
        }
    }

    fn zones() -> Vec<String> {
        vec!["us-west-2a".to_string(), "us-west-2b".to_string()]
    }

    #[test]
    fn test_pick_cidr() {
        assert_eq!(pick_cidr(&[]), "10.20.0.0/16");
        assert_eq!(
            pick_cidr(&["10.20.0.0/16".into(), "10.21.0.0/16".into()]),
            "10.22.0.0/16"
        );

        let all: Vec<String> = CANDIDATE_CIDRS
            .iter()
            .chain(std::iter::once(&EXTRA_CANDIDATE))
            .map(|c| c.to_string())
            .collect();
        assert_eq!(pick_cidr(&all), FALLBACK_CIDR);
    }

    #[test]
    fn test_subnet_cidr() {
        assert_eq!(subnet_cidr("10.20.0.0/16", 0).unwrap(), "10.20.0.0/24");
        assert_eq!(subnet_cidr("10.20.0.0/16", 3).unwrap(), "10.20.3.0/24");
        assert_eq!(subnet_cidr("172.31.0.0/20", 15).unwrap(), "172.31.15.0/24");
        // Beyond a /20 the fallback form is used
        assert_eq!(subnet_cidr("172.31.0.0/20", 16).unwrap(), "172.31.16.0/24");
        assert_eq!(subnet_cidr("10.0.0.0/22", 12).unwrap(), "10.0.12.0/24");

        assert!(subnet_cidr("10.0.0.0/28", 0).is_err());
        assert!(subnet_cidr("not-a-cidr", 0).is_err());
    }

    #[test]
    fn test_plan_subnets_avoids_taken_blocks() {
        let existing = HashSet::from(["10.20.0.0/24".to_string()]);
        let planned = plan_subnets("10.20.0.0/16", &zones(), 0, &existing).unwrap();

        assert_eq!(
            planned,
            vec![
                PlannedSubnet {
                    zone: "us-west-2a".into(),
                    cidr: "10.20.10.0/24".into()
                },
                PlannedSubnet {
                    zone: "us-west-2b".into(),
                    cidr: "10.20.1.0/24".into()
                },
            ]
        );
    }

    #[test]
    fn test_plan_subnets_skips_exhausted_zone() {
        // A /22 holds four /24s; the alternates all fall outside it
        let mut existing: HashSet<String> = (0..4).map(|i| format!("10.0.{}.0/24", i)).collect();
        existing.extend((10..30).map(|i| format!("10.0.{}.0/24", i)));

        let planned = plan_subnets("10.0.0.0/22", &zones(), 2, &existing).unwrap();
        assert!(planned.is_empty());
    }

    #[test]
    fn test_classify_by_name_then_route() {
        let snapshot = NetworkSnapshot {
            subnets: vec![
                subnet("subnet-1", "Public-A", "a"),
                subnet("subnet-2", "app-private", "a"),
                subnet("subnet-3", "", "b"),
                subnet("subnet-4", "", "b"),
                SubnetInfo {
                    state: "pending".into(),
                    ..subnet("subnet-5", "public-new", "c")
                },
            ],
            route_tables: vec![
                RouteTableInfo {
                    id: "rtb-main".into(),
                    main: true,
                    subnet_ids: vec![],
                    routes: vec![RouteInfo {
                        destination: "0.0.0.0/0".into(),
                        gateway_id: Some("igw-1".into()),
                        nat_gateway_id: None,
                    }],
                },
                RouteTableInfo {
                    id: "rtb-pub".into(),
                    main: false,
                    subnet_ids: vec!["subnet-3".into()],
                    routes: vec![RouteInfo {
                        destination: "0.0.0.0/0".into(),
                        gateway_id: Some("igw-1".into()),
                        nat_gateway_id: None,
                    }],
                },
            ],
        };

        let all = classify_subnets(&snapshot, false);
        let ids = |list: &[SubnetInfo]| list.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&all.public), ["subnet-1", "subnet-3", "subnet-5"]);
        // subnet-4 only has the main table, which does not count
        assert_eq!(ids(&all.private), ["subnet-2", "subnet-4"]);

        let available = classify_subnets(&snapshot, true);
        assert_eq!(ids(&available.public), ["subnet-1", "subnet-3"]);
    }

    #[test]
    fn test_load_balancer_subnet_validation() {
        let one = [subnet("subnet-1", "public", "a")];
        let err = validate_load_balancer_subnets(&one).unwrap_err();
        assert!(err.to_string().contains("Found only 1 public subnet"));

        let same_zone = [subnet("subnet-1", "public", "a"), subnet("subnet-2", "public", "a")];
        let err = validate_load_balancer_subnets(&same_zone).unwrap_err();
        assert!(err.to_string().contains("at least 2 different availability zones"));

        let ok = [subnet("subnet-1", "public", "a"), subnet("subnet-2", "public", "b")];
        assert_eq!(
            validate_load_balancer_subnets(&ok).unwrap(),
            vec!["subnet-1".to_string(), "subnet-2".to_string()]
        );
    }

    #[test]
    fn test_rejected_block_detection() {
        assert!(is_block_rejected(&CloudError::ApiError(
            "InvalidSubnet.Range: The CIDR '10.0.16.0/24' is invalid".into()
        )));
        assert!(!is_block_rejected(&CloudError::Throttled("slow down".into())));
    }
}
