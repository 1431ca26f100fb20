use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::sleep;
use tracing::warn;

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};

use super::{REASON_CONNECT, REASON_FORBIDDEN, REASON_THROTTLED, REASON_TIMEOUT, Slot};
use crate::evidence::CloudTrailEvent;

/* ============================= LIMITS ============================= */

/// CloudTrail LookupEvents is hard-capped at 90 days of history.
const CLOUDTRAIL_MAX_LOOKBACK: Duration = Duration::from_secs(90 * 24 * 3600);

/// Pacing between LookupEvents pages; the API allows 2 requests/second.
const CLOUDTRAIL_PAGE_PACING: Duration = Duration::from_millis(500);

const CLOUDTRAIL_THROTTLE_RETRIES: u32 = 3;

/* ============================= PROVIDER ============================= */

pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    elbv2: aws_sdk_elasticloadbalancingv2::Client,
    rds: aws_sdk_rds::Client,
    ecr: aws_sdk_ecr::Client,
    cloudtrail: aws_sdk_cloudtrail::Client,
}

impl AwsProvider {
    pub async fn connect() -> AwsProvider {
        let conf = aws_config::load_from_env().await;
        AwsProvider {
            ec2: aws_sdk_ec2::Client::new(&conf),
            elbv2: aws_sdk_elasticloadbalancingv2::Client::new(&conf),
            rds: aws_sdk_rds::Client::new(&conf),
            ecr: aws_sdk_ecr::Client::new(&conf),
            cloudtrail: aws_sdk_cloudtrail::Client::new(&conf),
        }
    }

    /// Snapshot every subsystem, one slot each, so a throttled or
    /// forbidden API never hides the others.
    pub async fn snapshots(&self) -> BTreeMap<String, Slot<serde_json::Value>> {
        let mut out = BTreeMap::new();
        out.insert("ec2_instances".to_string(), self.ec2_instances().await);
        out.insert("ebs_volumes".to_string(), self.ebs_volumes().await);
        out.insert("nat_gateways".to_string(), self.nat_gateways().await);
        out.insert("vpc_endpoints".to_string(), self.vpc_endpoints().await);
        out.insert("security_groups".to_string(), self.security_groups().await);
        out.insert("elb_target_health".to_string(), self.elb_target_health().await);
        out.insert("rds_instances".to_string(), self.rds_instances().await);
        out
    }

    async fn ec2_instances(&self) -> Slot<serde_json::Value> {
        match self.ec2.describe_instances().send().await {
            Ok(out) => {
                let mut states: BTreeMap<String, u32> = BTreeMap::new();
                let mut total = 0u32;
                for res in out.reservations() {
                    for inst in res.instances() {
                        total += 1;
                        let state = inst
                            .state()
                            .and_then(|s| s.name())
                            .map(|n| n.as_str().to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        *states.entry(state).or_insert(0) += 1;
                    }
                }
                if total == 0 {
                    Slot::empty()
                } else {
                    Slot::ok(json!({ "total": total, "by_state": states }))
                }
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    async fn ebs_volumes(&self) -> Slot<serde_json::Value> {
        match self.ec2.describe_volumes().send().await {
            Ok(out) => {
                let volumes: Vec<serde_json::Value> = out
                    .volumes()
                    .iter()
                    .map(|v| {
                        json!({
                            "id": v.volume_id(),
                            "state": v.state().map(|s| s.as_str()),
                            "type": v.volume_type().map(|t| t.as_str()),
                        })
                    })
                    .collect();
                if volumes.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(json!({ "count": volumes.len(), "volumes": volumes }))
                }
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    async fn nat_gateways(&self) -> Slot<serde_json::Value> {
        match self.ec2.describe_nat_gateways().send().await {
            Ok(out) => {
                let gateways: Vec<serde_json::Value> = out
                    .nat_gateways()
                    .iter()
                    .map(|g| {
                        json!({
                            "id": g.nat_gateway_id(),
                            "state": g.state().map(|s| s.as_str()),
                            "vpc": g.vpc_id(),
                        })
                    })
                    .collect();
                if gateways.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(json!({ "count": gateways.len(), "gateways": gateways }))
                }
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    async fn vpc_endpoints(&self) -> Slot<serde_json::Value> {
        match self.ec2.describe_vpc_endpoints().send().await {
            Ok(out) => {
                let endpoints: Vec<serde_json::Value> = out
                    .vpc_endpoints()
                    .iter()
                    .map(|e| {
                        json!({
                            "id": e.vpc_endpoint_id(),
                            "service": e.service_name(),
                            "state": e.state().map(|s| s.as_str()),
                        })
                    })
                    .collect();
                if endpoints.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(json!({ "count": endpoints.len(), "endpoints": endpoints }))
                }
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    async fn security_groups(&self) -> Slot<serde_json::Value> {
        match self.ec2.describe_security_groups().send().await {
            Ok(out) => {
                let count = out.security_groups().len();
                if count == 0 {
                    Slot::empty()
                } else {
                    Slot::ok(json!({ "count": count }))
                }
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    /// Target health for the first page of target groups; enough to spot
    /// an LB draining its backends.
    async fn elb_target_health(&self) -> Slot<serde_json::Value> {
        let groups = match self.elbv2.describe_target_groups().send().await {
            Ok(out) => out.target_groups().to_vec(),
            Err(e) => return Slot::unavailable(classify_sdk(&e)),
        };
        if groups.is_empty() {
            return Slot::empty();
        }

        let mut summaries = Vec::new();
        for group in groups.iter().take(10) {
            let Some(arn) = group.target_group_arn() else { continue };
            match self
                .elbv2
                .describe_target_health()
                .target_group_arn(arn)
                .send()
                .await
            {
                Ok(health) => {
                    let total = health.target_health_descriptions().len();
                    let unhealthy = health
                        .target_health_descriptions()
                        .iter()
                        .filter(|d| {
                            d.target_health()
                                .and_then(|h| h.state())
                                .map(|s| s.as_str() != "healthy")
                                .unwrap_or(false)
                        })
                        .count();
                    summaries.push(json!({
                        "target_group": group.target_group_name(),
                        "targets": total,
                        "unhealthy": unhealthy,
                    }));
                }
                Err(e) => summaries.push(json!({
                    "target_group": group.target_group_name(),
                    "error": classify_sdk(&e),
                })),
            }
        }
        Slot::ok(json!({ "groups": summaries }))
    }

    async fn rds_instances(&self) -> Slot<serde_json::Value> {
        match self.rds.describe_db_instances().send().await {
            Ok(out) => {
                let instances: Vec<serde_json::Value> = out
                    .db_instances()
                    .iter()
                    .map(|db| {
                        json!({
                            "id": db.db_instance_identifier(),
                            "status": db.db_instance_status(),
                            "engine": db.engine(),
                        })
                    })
                    .collect();
                if instances.is_empty() {
                    Slot::empty()
                } else {
                    Slot::ok(json!({ "count": instances.len(), "instances": instances }))
                }
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    /// Check an ECR repository for the presence of an image tag.
    pub async fn ecr_image_exists(&self, repository: &str, tag: &str) -> Slot<serde_json::Value> {
        match self
            .ecr
            .list_images()
            .repository_name(repository)
            .send()
            .await
        {
            Ok(out) => {
                let found = out
                    .image_ids()
                    .iter()
                    .any(|id| id.image_tag() == Some(tag));
                Slot::ok(json!({ "repository": repository, "tag": tag, "exists": found }))
            }
            Err(e) => Slot::unavailable(classify_sdk(&e)),
        }
    }

    /// CloudTrail LookupEvents over `[start, end]`, paginated with 2/s
    /// pacing, exponential backoff on throttling, clamped to the 90-day
    /// history cap and to `max_events` results.
    pub async fn cloudtrail_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_events: usize,
    ) -> Slot<Vec<CloudTrailEvent>> {
        let floor = end
            - chrono::Duration::from_std(CLOUDTRAIL_MAX_LOOKBACK)
                .unwrap_or_else(|_| chrono::Duration::days(90));
        let start = start.max(floor);

        let mut events: Vec<CloudTrailEvent> = Vec::new();
        let mut next_token: Option<String> = None;
        let mut throttle_retries = 0u32;

        loop {
            let mut req = self
                .cloudtrail
                .lookup_events()
                .start_time(aws_sdk_cloudtrail::primitives::DateTime::from_secs(
                    start.timestamp(),
                ))
                .end_time(aws_sdk_cloudtrail::primitives::DateTime::from_secs(
                    end.timestamp(),
                ))
                .max_results(50);
            if let Some(token) = &next_token {
                req = req.next_token(token.clone());
            }

            match req.send().await {
                Ok(out) => {
                    throttle_retries = 0;
                    for e in out.events() {
                        events.push(CloudTrailEvent {
                            event_name: e.event_name().unwrap_or_default().to_string(),
                            event_time: e
                                .event_time()
                                .and_then(|t| DateTime::from_timestamp(t.secs(), 0)),
                            username: e.username().map(str::to_string),
                            resources: e
                                .resources()
                                .iter()
                                .filter_map(|r| r.resource_name().map(str::to_string))
                                .collect(),
                        });
                        if events.len() >= max_events {
                            return Slot::ok(events);
                        }
                    }
                    next_token = out.next_token().map(str::to_string);
                    if next_token.is_none() {
                        break;
                    }
                    sleep(CLOUDTRAIL_PAGE_PACING).await;
                }
                Err(err) => {
                    let reason = classify_sdk(&err);
                    if reason == REASON_THROTTLED && throttle_retries < CLOUDTRAIL_THROTTLE_RETRIES
                    {
                        throttle_retries += 1;
                        let delay = CLOUDTRAIL_PAGE_PACING * 2u32.pow(throttle_retries);
                        warn!(retry = throttle_retries, "cloudtrail_throttled");
                        sleep(delay).await;
                        continue;
                    }
                    // Keep what was already paged in rather than dropping it.
                    if events.is_empty() {
                        return Slot::unavailable(reason);
                    }
                    return Slot::ok(events);
                }
            }
        }

        if events.is_empty() {
            Slot::empty()
        } else {
            Slot::ok(events)
        }
    }
}

/* ============================= ERROR CLASSIFICATION ============================= */

/// Map an SDK error onto the provider reason taxonomy.
pub fn classify_sdk<E, R>(err: &SdkError<E, R>) -> String
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) => REASON_TIMEOUT.to_string(),
        SdkError::DispatchFailure(_) => REASON_CONNECT.to_string(),
        _ => match err.code() {
            Some(code) if is_throttle_code(code) => REASON_THROTTLED.to_string(),
            Some(code) if is_forbidden_code(code) => REASON_FORBIDDEN.to_string(),
            Some(code) => format!("http_error:{code}"),
            None => "http_error:unknown".to_string(),
        },
    }
}

fn is_throttle_code(code: &str) -> bool {
    matches!(
        code,
        "Throttling" | "ThrottlingException" | "RequestLimitExceeded" | "TooManyRequestsException"
    )
}

fn is_forbidden_code(code: &str) -> bool {
    matches!(
        code,
        "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" | "UnauthorizedAccess"
    )
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_codes() {
        assert!(is_throttle_code("Throttling"));
        assert!(is_throttle_code("RequestLimitExceeded"));
        assert!(!is_throttle_code("AccessDenied"));
    }

    #[test]
    fn test_forbidden_codes() {
        assert!(is_forbidden_code("AccessDenied"));
        assert!(is_forbidden_code("UnauthorizedOperation"));
        assert!(!is_forbidden_code("Throttling"));
    }
}
