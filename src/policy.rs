//! Request policy: address rewriting, rule checks and name resolution.
//!
//! The server applies these in a fixed order for every request: the rewriter
//! first, so rules see the effective destination, then the rule set. Name
//! resolution happens later, inside the command that needs a concrete IP.

use crate::protocol::Command;
use crate::request::Request;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;

/// Context is per-connection metadata shared between the policy stages and
/// the dialer. Rules and resolvers may annotate it for later stages.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// AddressRewriter can transparently change a request's destination
pub trait AddressRewriter: Send + Sync {
    fn rewrite(&self, ctx: &mut Context, request: &mut Request);
}

/// NoRewrite leaves every request untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRewrite;

impl AddressRewriter for NoRewrite {
    fn rewrite(&self, _ctx: &mut Context, _request: &mut Request) {}
}

/// RuleSet decides whether a request may proceed
#[async_trait]
pub trait RuleSet: Send + Sync {
    async fn allow(&self, ctx: &mut Context, request: &Request) -> bool;
}

/// PermitAll allows every request
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

#[async_trait]
impl RuleSet for PermitAll {
    async fn allow(&self, _ctx: &mut Context, _request: &Request) -> bool {
        true
    }
}

/// PermitCommand allows requests by command
#[derive(Debug, Clone, Copy)]
pub struct PermitCommand {
    pub enable_connect: bool,
    pub enable_bind: bool,
    pub enable_associate: bool,
}

impl PermitCommand {
    pub fn new(enable_connect: bool, enable_bind: bool, enable_associate: bool) -> Self {
        Self {
            enable_connect,
            enable_bind,
            enable_associate,
        }
    }

    pub fn permits(&self, command: Command) -> bool {
        match command {
            Command::Connect => self.enable_connect,
            Command::Bind => self.enable_bind,
            Command::UdpAssociate => self.enable_associate,
        }
    }
}

impl Default for PermitCommand {
    fn default() -> Self {
        Self::new(true, true, true)
    }
}

#[async_trait]
impl RuleSet for PermitCommand {
    async fn allow(&self, _ctx: &mut Context, request: &Request) -> bool {
        self.permits(request.command)
    }
}

/// NameResolver turns a domain name into an IP address
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, ctx: &mut Context, name: &str) -> Result<IpAddr>;
}

/// DnsResolver uses the system resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl NameResolver for DnsResolver {
    async fn resolve(&self, _ctx: &mut Context, name: &str) -> Result<IpAddr> {
        tokio::net::lookup_host((name, 0))
            .await
            .map_err(|e| anyhow!("failed to resolve host '{name}': {e}"))?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow!("no IP address found for '{name}'"))
    }
}
