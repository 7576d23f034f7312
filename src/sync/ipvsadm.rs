//! Kernel table backend driving `ipvsadm`.

use crate::model::{ForwardMode, Protocol, Scheduler};
use crate::sync::{CommandRunner, KernelLb, KernelService, RealServer, SyncError, VirtualService};
use async_trait::async_trait;
use std::net::SocketAddrV4;

const IPVSADM: &str = "ipvsadm";

pub struct Ipvsadm {
    runner: CommandRunner,
}

impl Ipvsadm {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

fn protocol_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "-t",
        Protocol::Udp => "-u",
    }
}

fn forward_flag(mode: ForwardMode) -> &'static str {
    match mode {
        ForwardMode::Nat => "-m",
        ForwardMode::Route => "-g",
        ForwardMode::Tunnel => "-i",
    }
}

fn service_args(op: &str, svc: &VirtualService) -> Vec<String> {
    let mut args = vec![
        op.to_string(),
        protocol_flag(svc.protocol).to_string(),
        format!("{}:{}", svc.address, svc.port),
        "-s".to_string(),
        svc.scheduler.as_str().to_string(),
    ];
    if svc.persistent > 0 {
        args.push("-p".to_string());
        args.push(svc.persistent.to_string());
    }
    args
}

fn destination_args(op: &str, svc: &VirtualService, dst: &RealServer) -> Vec<String> {
    vec![
        op.to_string(),
        protocol_flag(svc.protocol).to_string(),
        format!("{}:{}", svc.address, svc.port),
        "-r".to_string(),
        format!("{}:{}", dst.address, dst.port),
        forward_flag(dst.mode).to_string(),
        "-w".to_string(),
        dst.weight.to_string(),
    ]
}

/// Parse `ipvsadm -Ln` output.
///
/// Services that are not IPv4 TCP/UDP (firewall marks, SCTP, IPv6) are
/// skipped together with their real servers.
pub(crate) fn parse_table(output: &str) -> Result<Vec<KernelService>, SyncError> {
    let mut table: Vec<KernelService> = Vec::new();
    let mut skipping = true;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("->") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if skipping || fields.first() == Some(&"RemoteAddress:Port") {
                continue;
            }
            let Some(current) = table.last_mut() else {
                continue;
            };
            if fields.len() < 3 {
                return Err(SyncError::Parse(trimmed.to_string()));
            }
            let endpoint: SocketAddrV4 = fields[0]
                .parse()
                .map_err(|_| SyncError::Parse(format!("bad real server '{}'", fields[0])))?;
            let mode = match fields[1] {
                "Masq" => ForwardMode::Nat,
                "Route" | "Local" => ForwardMode::Route,
                "Tunnel" => ForwardMode::Tunnel,
                other => return Err(SyncError::Parse(format!("unknown forward method '{}'", other))),
            };
            let weight = fields[2]
                .parse()
                .map_err(|_| SyncError::Parse(format!("bad weight '{}'", fields[2])))?;
            current.destinations.push(RealServer {
                address: *endpoint.ip(),
                port: endpoint.port(),
                weight,
                mode,
            });
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let protocol = match fields.first() {
            Some(&"TCP") => Protocol::Tcp,
            Some(&"UDP") => Protocol::Udp,
            _ => {
                skipping = true;
                continue;
            }
        };
        let Some(endpoint) = fields.get(1).and_then(|e| e.parse::<SocketAddrV4>().ok()) else {
            skipping = true;
            continue;
        };
        let scheduler = fields
            .get(2)
            .and_then(|s| Scheduler::parse(s))
            .ok_or_else(|| SyncError::Parse(format!("unknown scheduler in '{}'", trimmed)))?;
        let persistent = match fields.iter().position(|f| *f == "persistent") {
            Some(i) => fields
                .get(i + 1)
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| SyncError::Parse(format!("bad persistence in '{}'", trimmed)))?,
            None => 0,
        };

        skipping = false;
        table.push(KernelService {
            service: VirtualService {
                address: *endpoint.ip(),
                port: endpoint.port(),
                protocol,
                scheduler,
                persistent,
            },
            destinations: Vec::new(),
        });
    }

    Ok(table)
}

#[async_trait]
impl KernelLb for Ipvsadm {
    async fn services(&self) -> Result<Vec<KernelService>, SyncError> {
        let output = self.runner.run(IPVSADM, &["-Ln"]).await?;
        parse_table(&output)
    }

    async fn add_service(&self, svc: &VirtualService) -> Result<(), SyncError> {
        self.runner.run(IPVSADM, &service_args("-A", svc)).await?;
        Ok(())
    }

    async fn update_service(&self, svc: &VirtualService) -> Result<(), SyncError> {
        self.runner.run(IPVSADM, &service_args("-E", svc)).await?;
        Ok(())
    }

    async fn delete_service(&self, svc: &VirtualService) -> Result<(), SyncError> {
        let args = [
            "-D".to_string(),
            protocol_flag(svc.protocol).to_string(),
            format!("{}:{}", svc.address, svc.port),
        ];
        self.runner.run(IPVSADM, &args).await?;
        Ok(())
    }

    async fn add_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError> {
        self.runner.run(IPVSADM, &destination_args("-a", svc, dst)).await?;
        Ok(())
    }

    async fn update_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError> {
        self.runner.run(IPVSADM, &destination_args("-e", svc, dst)).await?;
        Ok(())
    }

    async fn delete_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError> {
        let args = [
            "-d".to_string(),
            protocol_flag(svc.protocol).to_string(),
            format!("{}:{}", svc.address, svc.port),
            "-r".to_string(),
            format!("{}:{}", dst.address, dst.port),
        ];
        self.runner.run(IPVSADM, &args).await?;
        Ok(())
    }
}
