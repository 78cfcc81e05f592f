//! Network traffic observed while staging a fixture.
//!
//! A [`Stager`] runs one staging attempt locally with packet capture; the
//! [`TrafficMonitor`] turns its output into a [`TrafficReport`] and asserts
//! either that all traffic went through a [`RecordingProxy`] or that there
//! was none at all. Both assertions insist the build actually completed: a
//! staging run that failed early, or never started, proves nothing about the
//! network.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::process::{CommandRunner, Invocation};
use crate::proxy::RecordingProxy;

/// Prefix the staging script puts on every replayed capture line.
pub const TRAFFIC_PREFIX: &str = "internet traffic: ";
/// Printed right before the buildpack's first phase runs.
pub const STARTED_MARKER: &str = "stagehand: staging started";
/// Printed only when every buildpack phase succeeded.
pub const SUCCESS_MARKER: &str = "stagehand: staging succeeded";

/// A network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse tcpdump's numeric `a.b.c.d.port` form.
    pub fn parse_tcpdump(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_end_matches(':');
        let (host, port) = raw.rsplit_once('.')?;
        Some(Self::new(host, port.parse().ok()?))
    }

    /// `host.port`, as tcpdump prints it.
    pub fn tcpdump_form(&self) -> String {
        format!("{}.{}", self.host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source and destination of one captured packet line.
fn parse_packet(line: &str) -> Option<(Destination, Destination)> {
    let line = line.strip_prefix(TRAFFIC_PREFIX).unwrap_or(line);
    let mut fields = line.split_whitespace();
    // `IP` or `IP6`, optionally preceded by a timestamp.
    fields.find(|f| *f == "IP" || *f == "IP6")?;
    let src = Destination::parse_tcpdump(fields.next()?)?;
    if fields.next()? != ">" {
        return None;
    }
    let dst = Destination::parse_tcpdump(fields.next()?)?;
    Some((src, dst))
}

/// Remote endpoints contacted during one staging attempt.
///
/// A flow's destination is the endpoint its first captured packet was sent
/// to; replies within the same flow are not counted again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficRecord {
    destinations: Vec<Destination>,
    packets: usize,
}

impl TrafficRecord {
    pub fn from_lines<'a, I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut flows: HashSet<(Destination, Destination)> = HashSet::new();
        let mut record = Self::default();
        for line in lines {
            if !line.starts_with(TRAFFIC_PREFIX) {
                continue;
            }
            let Some((src, dst)) = parse_packet(line) else {
                continue;
            };
            record.packets += 1;
            let key = if src <= dst {
                (src.clone(), dst.clone())
            } else {
                (dst.clone(), src.clone())
            };
            if flows.insert(key) {
                record.destinations.push(dst);
            }
        }
        record
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn packets(&self) -> usize {
        self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.destinations.iter().any(|d| d.host == host)
    }

    /// Every flow went to `expected`.
    pub fn unique_destination(&self, expected: &Destination) -> Result<()> {
        let others: Vec<String> = self
            .destinations
            .iter()
            .filter(|d| *d != expected)
            .map(ToString::to_string)
            .collect();
        if others.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::TrafficViolation(format!(
                "expected only {}, also saw {}",
                expected,
                others.join(", ")
            )))
        }
    }
}

/// Raw result of one local staging attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingRun {
    pub exit_code: Option<i32>,
    pub lines: Vec<String>,
}

/// How far staging got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingOutcome {
    Built,
    Failed { exit_code: Option<i32> },
    NeverRan,
}

impl StagingRun {
    pub fn outcome(&self) -> StagingOutcome {
        let started = self.lines.iter().any(|l| l.contains(STARTED_MARKER));
        let succeeded = self.lines.iter().any(|l| l.contains(SUCCESS_MARKER));
        match (started, succeeded, self.exit_code) {
            (false, _, _) => StagingOutcome::NeverRan,
            (true, true, Some(0)) => StagingOutcome::Built,
            (true, _, code) => StagingOutcome::Failed { exit_code: code },
        }
    }
}

/// Runs a fixture through a buildpack's staging phases with packet capture.
#[async_trait]
pub trait Stager: Send + Sync {
    async fn stage(
        &self,
        fixture: &Path,
        buildpack: &Path,
        env: &[(String, String)],
    ) -> Result<StagingRun>;
}

/// Stages inside the stack's container image with `tcpdump` running.
pub struct DockerStager {
    runner: Arc<dyn CommandRunner>,
    image: String,
}

const STAGING_SCRIPT: &str = r#"
mkdir -p /tmp/buildpack /tmp/staged /tmp/cache /tmp/deps /tmp/profile.d
cp -a /tmp/app/. /tmp/staged/
unzip -qq /tmp/buildpack.zip -d /tmp/buildpack || exit 90
tcpdump -n -i eth0 not udp port 53 and not udp port 1900 and not udp port 5353 -t -Uw /tmp/dumplog >/dev/null 2>&1 &
sleep 2
echo "stagehand: staging started"
(
  set -e
  /tmp/buildpack/bin/detect /tmp/staged
  if [ -x /tmp/buildpack/bin/supply ]; then
    /tmp/buildpack/bin/supply /tmp/staged /tmp/cache /tmp/deps 0
  fi
  if [ -x /tmp/buildpack/bin/finalize ]; then
    /tmp/buildpack/bin/finalize /tmp/staged /tmp/cache /tmp/deps 0 /tmp/profile.d
  else
    /tmp/buildpack/bin/compile /tmp/staged /tmp/cache
  fi
)
status=$?
if [ $status -eq 0 ]; then echo "stagehand: staging succeeded"; fi
sleep 2
pkill tcpdump || true
sleep 1
tcpdump -n -r /tmp/dumplog 2>/dev/null | sed -e 's/^/internet traffic: /'
exit $status
"#;

impl DockerStager {
    pub fn new(runner: Arc<dyn CommandRunner>, image: impl Into<String>) -> Self {
        Self {
            runner,
            image: image.into(),
        }
    }

    pub fn invocation(&self, fixture: &Path, buildpack: &Path, env: &[(String, String)]) -> Invocation {
        let mut inv = Invocation::new("docker").args([
            "run".to_string(),
            "--rm".to_string(),
            "--cap-add=NET_ADMIN".to_string(),
            "--cap-add=NET_RAW".to_string(),
            "-v".to_string(),
            format!("{}:/tmp/app:ro", fixture.display()),
            "-v".to_string(),
            format!("{}:/tmp/buildpack.zip:ro", buildpack.display()),
        ]);
        for (k, v) in env {
            inv = inv.arg("-e").arg(format!("{}={}", k, v));
        }
        inv.arg(&self.image).args(["bash", "-c", STAGING_SCRIPT])
    }
}

#[async_trait]
impl Stager for DockerStager {
    async fn stage(
        &self,
        fixture: &Path,
        buildpack: &Path,
        env: &[(String, String)],
    ) -> Result<StagingRun> {
        let inv = self.invocation(fixture, buildpack, env);
        info!(fixture = %fixture.display(), image = %self.image, "staging locally with packet capture");
        let output = self.runner.run(&inv).await?;
        let lines = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(String::from)
            .collect();
        Ok(StagingRun {
            exit_code: output.status,
            lines,
        })
    }
}

/// Outcome and traffic of one monitored staging attempt.
#[derive(Debug, Clone)]
pub struct TrafficReport {
    pub outcome: StagingOutcome,
    pub traffic: TrafficRecord,
    pub logs: Vec<String>,
}

impl TrafficReport {
    fn require_built(&self) -> Result<()> {
        match self.outcome {
            StagingOutcome::Built => Ok(()),
            StagingOutcome::Failed { exit_code } => Err(HarnessError::StagingIncomplete(format!(
                "staging failed with exit code {:?}; last output: {}",
                exit_code,
                self.logs
                    .iter()
                    .rev()
                    .find(|l| !l.starts_with(TRAFFIC_PREFIX))
                    .map(String::as_str)
                    .unwrap_or("<none>")
            ))),
            StagingOutcome::NeverRan => Err(HarnessError::StagingIncomplete(
                "staging never started".to_string(),
            )),
        }
    }
}

/// Asserts on the network behavior of staging.
pub struct TrafficMonitor {
    stager: Arc<dyn Stager>,
    proxy_bind: SocketAddr,
    proxy_host: Option<String>,
}

impl TrafficMonitor {
    pub fn new(stager: Arc<dyn Stager>) -> Self {
        Self {
            stager,
            proxy_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            proxy_host: None,
        }
    }

    /// Where the proxy listens, and the host name the stager should use for it.
    pub fn with_proxy_address(mut self, bind: SocketAddr, advertised_host: Option<String>) -> Self {
        self.proxy_bind = bind;
        self.proxy_host = advertised_host;
        self
    }

    /// Stage once and collect what happened.
    pub async fn capture(
        &self,
        fixture: &Path,
        buildpack: &Path,
        env: &[(String, String)],
    ) -> Result<TrafficReport> {
        let run = self.stager.stage(fixture, buildpack, env).await?;
        let outcome = run.outcome();
        let traffic = TrafficRecord::from_lines(run.lines.iter().map(String::as_str));
        debug!(?outcome, flows = traffic.destinations().len(), packets = traffic.packets(), "staging captured");
        Ok(TrafficReport {
            outcome,
            traffic,
            logs: run.lines,
        })
    }

    /// Stage through a fresh proxy; all traffic must go to it.
    ///
    /// With `expected_host`, the proxy must also only have been asked for that host.
    pub async fn assert_routes_through_proxy(
        &self,
        fixture: &Path,
        buildpack: &Path,
        expected_host: Option<&str>,
    ) -> Result<TrafficReport> {
        let proxy = RecordingProxy::bind(self.proxy_bind, self.proxy_host.clone()).await?;
        let report = self.capture(fixture, buildpack, &proxy.env()).await?;
        report.require_built()?;
        report.traffic.unique_destination(&proxy.destination())?;

        let hosts = proxy.hosts();
        if hosts.is_empty() {
            return Err(HarnessError::TrafficViolation(
                "staging never used the proxy".to_string(),
            ));
        }
        if let Some(expected) = expected_host {
            let unexpected: Vec<&String> = hosts.iter().filter(|h| *h != expected).collect();
            if !unexpected.is_empty() {
                return Err(HarnessError::TrafficViolation(format!(
                    "proxy saw requests for {:?}, expected only {}",
                    unexpected, expected
                )));
            }
        }
        info!(fixture = %fixture.display(), ?hosts, "staging routed through proxy");
        Ok(report)
    }

    /// Stage without a proxy; there must be no traffic at all.
    pub async fn assert_airgapped(&self, fixture: &Path, buildpack: &Path) -> Result<TrafficReport> {
        let report = self.capture(fixture, buildpack, &[]).await?;
        report.require_built()?;
        if !report.traffic.is_empty() {
            let seen: Vec<String> = report
                .traffic
                .destinations()
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(HarnessError::TrafficViolation(format!(
                "airgapped staging contacted {}",
                seen.join(", ")
            )));
        }
        info!(fixture = %fixture.display(), "staging made no network calls");
        Ok(report)
    }
}
