//! 主机注册
//!
//! 主机凭注册令牌下载引导脚本（setup）并注册（register）：管理端校验令牌、
//! Agent 版本与 CSR 的 commonName，签发客户端证书并创建主机。之后的请求由
//! TLS 前端校验证书，并以 `X-SSL-CLIENT-SERIAL` / `X-SSL-CLIENT-NAME` 头传入身份。

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use serde::{Deserialize, Serialize};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::core::error::{ProtocolViolation, RegistrationError, SchedulingError};
use crate::scheduler::job_scheduler::JobScheduler;
use crate::state::entity::EntityPayload;

/// 注册令牌：限定 profile、可用次数与有效期
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationToken {
    pub secret: String,
    pub profile: String,
    pub credits: u32,
    pub expiry: DateTime<Utc>,
    pub cancelled: bool,
}

#[derive(Default)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, RegistrationToken>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, profile: &str, credits: u32, ttl: chrono::Duration) -> RegistrationToken {
        let token = RegistrationToken {
            secret: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            profile: profile.to_string(),
            credits,
            expiry: Utc::now() + ttl,
            cancelled: false,
        };
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.secret.clone(), token.clone());
        token
    }

    pub fn cancel(&self, secret: &str) -> bool {
        match self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(secret)
        {
            Some(token) => {
                token.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, secret: &str) -> Option<RegistrationToken> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(secret)
            .cloned()
    }

    /// 校验令牌并扣除 `credits` 次；失败的尝试不扣次数
    pub fn validate(&self, secret: &str, credits: u32) -> Result<RegistrationToken, RegistrationError> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(token) = tokens.get_mut(secret) else {
            tracing::warn!(token = secret, "Attempt to register with non-existent token");
            return Err(RegistrationError::InvalidToken);
        };
        if token.credits == 0 {
            tracing::warn!(token = secret, "Attempt to register with exhausted token");
            return Err(RegistrationError::InvalidToken);
        }
        let now = Utc::now();
        if token.expiry < now {
            tracing::warn!(token = secret, expiry = %token.expiry, "Attempt to register with expired token");
            return Err(RegistrationError::InvalidToken);
        }
        if token.cancelled {
            tracing::warn!(token = secret, "Attempt to register with cancelled token");
            return Err(RegistrationError::InvalidToken);
        }
        token.credits = token.credits.saturating_sub(credits);
        Ok(token.clone())
    }
}

/// 签发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub serial: String,
}

/// 证书签发方
pub trait CertificateAuthority: Send + Sync {
    /// 下发给 Agent 用于校验管理端的 CA 证书
    fn authority_certificate(&self) -> String;

    fn common_name(&self, csr: &str) -> Result<String, RegistrationError>;

    fn sign(&self, csr: &str) -> Result<IssuedCertificate, RegistrationError>;
}

const AUTHORITY_KEY_FILE: &str = "authority.pem";
const AUTHORITY_CERT_FILE: &str = "authority.crt";

fn authority_error(e: impl fmt::Display) -> RegistrationError {
    RegistrationError::Authority(e.to_string())
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// 读取 PEM 编码的 CSR，校验自签名后返回 commonName
pub fn csr_common_name(csr: &str) -> Result<String, RegistrationError> {
    let (_, pem) = parse_x509_pem(csr.as_bytes())
        .map_err(|e| RegistrationError::Malformed(format!("CSR is not PEM: {e}")))?;
    if !pem.label.ends_with("CERTIFICATE REQUEST") {
        return Err(RegistrationError::Malformed(format!(
            "expected a certificate request, got '{}'",
            pem.label
        )));
    }
    let (_, request) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| RegistrationError::Malformed(format!("CSR is not valid DER: {e}")))?;
    request
        .verify_signature()
        .map_err(|e| RegistrationError::Malformed(format!("CSR signature invalid: {e}")))?;

    let common_name = request
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::trim)
        .filter(|cn| !cn.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RegistrationError::Malformed("CSR has no commonName".into()));
    common_name
}

/// 证书序列号，大写十六进制，与 TLS 前端传入的 `X-SSL-CLIENT-SERIAL` 形式一致
pub fn certificate_serial(certificate: &str) -> Result<String, RegistrationError> {
    let (_, pem) = parse_x509_pem(certificate.as_bytes())
        .map_err(|e| RegistrationError::Malformed(format!("certificate is not PEM: {e}")))?;
    let parsed = pem
        .parse_x509()
        .map_err(|e| RegistrationError::Malformed(format!("certificate is not valid DER: {e}")))?;
    Ok(hex_upper(parsed.tbs_certificate.raw_serial()))
}

/// 本地 CA：自签名根证书，为 Agent 签发客户端证书
///
/// `load_or_create` 从目录中的 `authority.pem` / `authority.crt` 加载，缺失时生成并写入；
/// `generate` 只在内存中生成，重启后此前签发的证书不再能被校验。
pub struct LocalAuthority {
    certificate_pem: String,
    certificate: Certificate,
    key: KeyPair,
}

impl LocalAuthority {
    pub fn generate(name: &str) -> Result<Self, RegistrationError> {
        let key = KeyPair::generate().map_err(authority_error)?;
        let certificate = Self::authority_params(name)?
            .self_signed(&key)
            .map_err(authority_error)?;
        Ok(Self {
            certificate_pem: certificate.pem(),
            certificate,
            key,
        })
    }

    pub fn load_or_create(name: &str, dir: &Path) -> Result<Self, RegistrationError> {
        let key_path = dir.join(AUTHORITY_KEY_FILE);
        let cert_path = dir.join(AUTHORITY_CERT_FILE);

        if key_path.exists() && cert_path.exists() {
            let key = KeyPair::from_pem(&fs::read_to_string(&key_path).map_err(authority_error)?)
                .map_err(authority_error)?;
            let certificate_pem = fs::read_to_string(&cert_path).map_err(authority_error)?;
            // 用磁盘上的主体与密钥重建签发者，已下发的根证书保持有效
            let certificate = CertificateParams::from_ca_cert_pem(&certificate_pem)
                .map_err(authority_error)?
                .self_signed(&key)
                .map_err(authority_error)?;
            tracing::info!(path = %cert_path.display(), "Loaded certificate authority");
            return Ok(Self {
                certificate_pem,
                certificate,
                key,
            });
        }

        let authority = Self::generate(name)?;
        fs::create_dir_all(dir).map_err(authority_error)?;
        fs::write(&key_path, authority.key.serialize_pem()).map_err(authority_error)?;
        fs::write(&cert_path, &authority.certificate_pem).map_err(authority_error)?;
        tracing::info!(path = %cert_path.display(), "Generated certificate authority");
        Ok(authority)
    }

    fn authority_params(name: &str) -> Result<CertificateParams, RegistrationError> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(authority_error)?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::OrganizationName, "hive");
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        Ok(params)
    }
}

impl CertificateAuthority for LocalAuthority {
    fn authority_certificate(&self) -> String {
        self.certificate_pem.clone()
    }

    fn common_name(&self, csr: &str) -> Result<String, RegistrationError> {
        csr_common_name(csr)
    }

    fn sign(&self, csr: &str) -> Result<IssuedCertificate, RegistrationError> {
        let mut request = CertificateSigningRequestParams::from_pem(csr)
            .map_err(|e| RegistrationError::Malformed(format!("CSR rejected: {e}")))?;

        // 首字节落在 0x40..=0x7f：DER 整数为正且不截断，十六进制串与证书内一致
        let mut serial = *uuid::Uuid::new_v4().as_bytes();
        serial[0] = (serial[0] & 0x7f) | 0x40;

        request.params.serial_number = Some(SerialNumber::from_slice(&serial));
        request.params.is_ca = IsCa::ExplicitNoCa;
        request.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        request.params.use_authority_key_identifier_extension = true;

        let certificate = request
            .signed_by(&self.certificate, &self.key)
            .map_err(authority_error)?;
        Ok(IssuedCertificate {
            certificate: certificate.pem(),
            serial: hex_upper(&serial),
        })
    }
}

/// 由 TLS 前端传入的客户端身份
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub serial: Option<String>,
    pub name: Option<String>,
}

impl ClientIdentity {
    pub fn new(serial: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            name: Some(name.into()),
        }
    }
}

/// 有效证书：序列号 -> fqdn
#[derive(Default)]
pub struct CertificateRegistry {
    valid: RwLock<HashMap<String, String>>,
}

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, serial: &str, fqdn: &str) {
        self.valid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(serial.to_string(), fqdn.to_string());
    }

    /// 吊销某主机的全部证书，返回吊销数量
    pub fn revoke_host(&self, fqdn: &str) -> usize {
        let mut valid = self.valid.write().unwrap_or_else(PoisonError::into_inner);
        let before = valid.len();
        valid.retain(|serial, owner| {
            let revoke = owner == fqdn;
            if revoke {
                tracing::info!(fqdn, serial = %serial, "Revoking certificate");
            }
            !revoke
        });
        before - valid.len()
    }

    /// 证书对应的 fqdn；未知或缺失的证书被拒绝
    pub fn validate(&self, identity: &ClientIdentity) -> Result<String, ProtocolViolation> {
        let serial = identity.serial.as_deref().ok_or(ProtocolViolation::Forbidden)?;
        let fqdn = self
            .valid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
            .ok_or(ProtocolViolation::Forbidden)?;
        if let Some(name) = identity.name.as_deref().filter(|n| *n != fqdn) {
            tracing::info!(serial, fqdn = %fqdn, name, "Client name differs from registered fqdn");
        }
        Ok(fqdn)
    }
}

/// 主次版本号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(['.', '-']);
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
        Some(Self { major, minor })
    }

    /// Agent 可用：主版本相同，且管理端次版本不低于 Agent
    pub fn accepts(&self, agent: &Version) -> bool {
        self.major == agent.major && self.minor >= agent.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub fqdn: String,
    pub nodename: String,
    pub address: String,
    pub version: String,
    pub csr: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub command_id: u64,
    pub host_id: u64,
    pub certificate: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReregisterRequest {
    pub fqdn: String,
    pub address: String,
}

const BOOTSTRAP_TEMPLATE: &str = r#"#!/bin/sh
# hive agent bootstrap
set -e

SERVER_EPOCH_SECONDS={server_epoch_seconds}
REGISTRATION_URL="{reg_url}"
REPO_URL="{repo_url}"

mkdir -p /etc/hive
cat > /etc/hive/authority.crt <<'EOF_CERT'
{cert_str}EOF_CERT

cat > /etc/yum.repos.d/hive.repo <<'EOF_REPO'
{repos}EOF_REPO

yum install -y --enablerepo={repo_names} {repo_packages}

cat > /etc/hive/profile.json <<'EOF_PROFILE'
{profile_json}
EOF_PROFILE

hive-agent register --url "$REGISTRATION_URL" --server-epoch "$SERVER_EPOCH_SECONDS"
"#;

pub struct Registrar {
    tokens: Arc<TokenStore>,
    authority: Arc<dyn CertificateAuthority>,
    certificates: Arc<CertificateRegistry>,
    scheduler: Arc<JobScheduler>,
    version: String,
    base_url: String,
}

impl Registrar {
    pub fn new(
        tokens: Arc<TokenStore>,
        authority: Arc<dyn CertificateAuthority>,
        certificates: Arc<CertificateRegistry>,
        scheduler: Arc<JobScheduler>,
        version: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            authority,
            certificates,
            scheduler,
            version: version.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// 生成引导脚本；不消耗令牌次数
    pub fn setup(&self, key: &str, profile_name: Option<&str>) -> Result<String, RegistrationError> {
        self.tokens.validate(key, 0)?;

        let profile_name = profile_name.ok_or_else(|| {
            tracing::error!("Profile name not specified");
            RegistrationError::BadProfile("Profile name not specified".into())
        })?;
        let profile = self.scheduler.profiles().get(profile_name).ok_or_else(|| {
            tracing::error!(profile = profile_name, "Not a valid profile");
            RegistrationError::BadProfile(format!("Profile {profile_name} not a valid profile"))
        })?;

        let repo_url = format!("{}/repo/", self.base_url);
        let repos: String = profile
            .bundles
            .iter()
            .map(|bundle| {
                format!(
                    "[{bundle}]\nname={bundle}\nbaseurl={repo_url}{bundle}/$releasever/\nenabled=0\ngpgcheck=0\nsslverify=1\nproxy=_none_\n\n"
                )
            })
            .collect();

        let mut packages = String::from("hive-agent");
        if profile.managed {
            packages.push_str(" hive-agent-management");
        }
        let profile_json = serde_json::to_string(profile)
            .map_err(|e| RegistrationError::Malformed(e.to_string()))?;

        let script = BOOTSTRAP_TEMPLATE
            .replace("{server_epoch_seconds}", &Utc::now().timestamp().to_string())
            .replace("{reg_url}", &format!("{}/agent/register/{key}/", self.base_url))
            .replace("{repo_url}", &repo_url)
            .replace("{cert_str}", &self.authority.authority_certificate())
            .replace("{repos}", &repos)
            .replace("{repo_names}", &profile.bundles.join(","))
            .replace("{repo_packages}", &packages)
            .replace("{profile_json}", &profile_json);
        Ok(script)
    }

    /// 注册主机：签发证书，创建主机与 LNet，并提交到 profile 初始状态的命令
    pub fn register(
        &self,
        key: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, RegistrationError> {
        let token = self.tokens.validate(key, 1)?;

        // 任一版本无法解析时不做检查
        if let (Some(manager), Some(agent)) =
            (Version::parse(&self.version), Version::parse(&request.version))
        {
            if !manager.accepts(&agent) {
                tracing::error!(%manager, %agent, "Version incompatibility");
                return Err(RegistrationError::VersionMismatch {
                    manager: manager.to_string(),
                    agent: agent.to_string(),
                });
            }
        }

        let csr_fqdn = self.authority.common_name(&request.csr)?;
        if csr_fqdn != request.fqdn {
            tracing::error!(csr_fqdn = %csr_fqdn, fqdn = %request.fqdn, "FQDN mismatch");
            return Err(RegistrationError::FqdnMismatch);
        }

        if let Some(existing) = self.scheduler.cache().host_by_fqdn(&request.fqdn) {
            if existing.state != "undeployed" {
                return Err(RegistrationError::FqdnInUse);
            }
        }

        let issued = self.authority.sign(&request.csr)?;
        tracing::info!(fqdn = %request.fqdn, serial = %issued.serial, "Generated certificate");

        let (host, command_id) = self.scheduler.create_host(
            &request.fqdn,
            &request.nodename,
            &request.address,
            &token.profile,
        )?;
        self.certificates.insert(&issued.serial, &request.fqdn);

        Ok(RegisterResponse {
            command_id,
            host_id: host.id,
            certificate: issued.certificate,
        })
    }

    /// 已注册主机更换名称或地址
    pub fn reregister(
        &self,
        identity: &ClientIdentity,
        request: &ReregisterRequest,
    ) -> Result<(), RegistrationError> {
        let fqdn = self
            .certificates
            .validate(identity)
            .map_err(|_| RegistrationError::Unauthenticated)?;
        let serial = identity
            .serial
            .as_deref()
            .ok_or(RegistrationError::Unauthenticated)?;

        let cache = self.scheduler.cache();
        let mut host = cache
            .host_by_fqdn(&fqdn)
            .ok_or_else(|| RegistrationError::UnknownHost(fqdn.clone()))?;
        if let EntityPayload::Host(record) = &mut host.payload {
            record.fqdn = request.fqdn.clone();
            record.address = request.address.clone();
        }
        cache.save(&host).map_err(SchedulingError::from)?;
        self.certificates.insert(serial, &request.fqdn);
        tracing::info!(previous = %fqdn, fqdn = %request.fqdn, address = %request.address, "Host re-registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation() {
        let tokens = TokenStore::new();
        let token = tokens.issue("storage_server", 1, chrono::Duration::hours(1));

        assert!(tokens.validate(&token.secret, 0).is_ok());
        assert_eq!(tokens.get(&token.secret).unwrap().credits, 1);
        assert!(tokens.validate(&token.secret, 1).is_ok());
        assert_eq!(
            tokens.validate(&token.secret, 1),
            Err(RegistrationError::InvalidToken)
        );
        assert_eq!(tokens.validate("nope", 0), Err(RegistrationError::InvalidToken));

        let expired = tokens.issue("storage_server", 5, chrono::Duration::seconds(-1));
        assert_eq!(
            tokens.validate(&expired.secret, 1),
            Err(RegistrationError::InvalidToken)
        );
        assert_eq!(tokens.get(&expired.secret).unwrap().credits, 5);

        let cancelled = tokens.issue("storage_server", 5, chrono::Duration::hours(1));
        assert!(tokens.cancel(&cancelled.secret));
        assert!(tokens.validate(&cancelled.secret, 1).is_err());
    }

    #[test]
    fn test_version_compatibility() {
        let manager = Version::parse("4.2.1").unwrap();
        assert!(manager.accepts(&Version::parse("4.2").unwrap()));
        assert!(manager.accepts(&Version::parse("4.0.9").unwrap()));
        assert!(!manager.accepts(&Version::parse("4.3").unwrap()));
        assert!(!manager.accepts(&Version::parse("5.0").unwrap()));
        assert_eq!(Version::parse("dev"), None);
    }

    /// 以真实密钥生成 PEM 编码的 CSR
    fn csr(common_name: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::OrganizationName, "hive");
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn test_local_authority_reads_and_signs_real_csr() {
        let ca = LocalAuthority::generate("hive").unwrap();
        let request = csr("oss1.example.com");
        assert_eq!(ca.common_name(&request).unwrap(), "oss1.example.com");

        let a = ca.sign(&request).unwrap();
        let b = ca.sign(&request).unwrap();
        assert_ne!(a.serial, b.serial);
        assert!(a.certificate.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(certificate_serial(&a.certificate).unwrap(), a.serial);

        let (_, pem) = parse_x509_pem(a.certificate.as_bytes()).unwrap();
        let issued = pem.parse_x509().unwrap();
        assert_eq!(
            issued.subject().iter_common_name().next().unwrap().as_str().unwrap(),
            "oss1.example.com"
        );
        assert_eq!(
            issued.issuer().iter_common_name().next().unwrap().as_str().unwrap(),
            "hive"
        );
        let (_, root) = parse_x509_pem(ca.authority_certificate().as_bytes()).unwrap();
        let root = root.parse_x509().unwrap();
        assert!(issued.verify_signature(Some(root.public_key())).is_ok());
    }

    #[test]
    fn test_local_authority_rejects_malformed_csr() {
        let ca = LocalAuthority::generate("hive").unwrap();
        assert!(matches!(
            ca.common_name("CN=oss1.example.com"),
            Err(RegistrationError::Malformed(_))
        ));

        // 改动 base64 正文中的一个字符，DER 解析或自签名校验必然失败
        let request = csr("oss1.example.com");
        let mut lines: Vec<String> = request.lines().map(str::to_string).collect();
        let first = lines[2].remove(0);
        lines[2].insert(0, if first == 'A' { 'B' } else { 'A' });
        let tampered = lines.join("\n");
        assert!(ca.common_name(&tampered).is_err());
        assert!(ca.sign(&tampered).is_err());
    }

    #[test]
    fn test_authority_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = LocalAuthority::load_or_create("hive", dir.path()).unwrap();
        let issued = first.sign(&csr("oss1.example.com")).unwrap();

        let second = LocalAuthority::load_or_create("hive", dir.path()).unwrap();
        assert_eq!(second.authority_certificate(), first.authority_certificate());

        // 重启后签发的证书仍由同一根证书校验
        let (_, root) = parse_x509_pem(second.authority_certificate().as_bytes()).unwrap();
        let root = root.parse_x509().unwrap();
        let later = second.sign(&csr("oss2.example.com")).unwrap();
        for certificate in [issued.certificate, later.certificate] {
            let (_, pem) = parse_x509_pem(certificate.as_bytes()).unwrap();
            let cert = pem.parse_x509().unwrap();
            assert!(cert.verify_signature(Some(root.public_key())).is_ok());
        }
    }

    #[test]
    fn test_certificate_registry() {
        let certs = CertificateRegistry::new();
        certs.insert("AA", "oss1");
        certs.insert("BB", "oss1");
        certs.insert("CC", "oss2");

        assert_eq!(certs.validate(&ClientIdentity::new("AA", "oss1")).unwrap(), "oss1");
        assert_eq!(
            certs.validate(&ClientIdentity::default()),
            Err(ProtocolViolation::Forbidden)
        );
        assert_eq!(certs.revoke_host("oss1"), 2);
        assert!(certs.validate(&ClientIdentity::new("AA", "oss1")).is_err());
        assert!(certs.validate(&ClientIdentity::new("CC", "oss2")).is_ok());
    }
}
