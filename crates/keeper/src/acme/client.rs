//! ACME client wrapper around `instant-acme`.
//!
//! Owns the account lifecycle (create once, persist credentials, restore on
//! later runs) and the order flow. The protocol itself is delegated
//! entirely to `instant-acme`; this wrapper adds credential storage, the
//! webroot challenge hand-off, and error classification.

use std::fs;
use std::path::{Path, PathBuf};

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus, RetryPolicy,
};
use tracing::{debug, info, warn};

use certkeeper_config::IssuerConfig;

use crate::bundle::{parse_leaf_metadata, split_chain, LeafMetadata};

use super::{AcmeError, WebrootChallenges};

const CREDENTIALS_FILE: &str = "credentials.json";

/// Freshly issued certificate material, not yet published.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub fullchain_pem: String,
    pub privkey_pem: String,
    /// Intermediates only, when the CA returned more than the leaf.
    pub chain_pem: Option<String>,
    pub meta: LeafMetadata,
}

/// ACME account handle plus the order configuration.
pub struct AcmeClient {
    account: Account,
    domains: Vec<String>,
    directory_url: String,
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("domains", &self.domains)
            .field("directory_url", &self.directory_url)
            .finish()
    }
}

impl AcmeClient {
    /// Connect to the CA: restore the persisted account if present,
    /// otherwise register a new one and persist its credentials.
    pub async fn connect(config: &IssuerConfig) -> Result<Self, AcmeError> {
        let directory_url = config.directory_url();
        let storage = &config.storage;
        ensure_private_dir(storage)?;

        let creds_path = storage.join(CREDENTIALS_FILE);
        let account = match load_credentials(&creds_path)? {
            Some(credentials) => {
                debug!(directory = %directory_url, "Restoring ACME account from stored credentials");
                Account::builder()?.from_credentials(credentials).await?
            }
            None => {
                info!(
                    directory = %directory_url,
                    contact = %config.contact,
                    "Registering new ACME account"
                );
                let contact = format!("mailto:{}", config.contact);
                let (account, credentials) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &[contact.as_str()],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        directory_url.clone(),
                        None,
                    )
                    .await?;
                save_credentials(&creds_path, &credentials)?;
                account
            }
        };

        Ok(Self {
            account,
            domains: config.domains.clone(),
            directory_url,
        })
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Run one full order: all configured domains as SANs, HTTP-01
    /// challenges through the webroot.
    ///
    /// Published challenge files are removed before returning, on success
    /// and failure alike.
    pub async fn order_certificate(
        &self,
        challenges: &WebrootChallenges,
    ) -> Result<IssuedCertificate, AcmeError> {
        let identifiers: Vec<Identifier> = self
            .domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        info!(
            domains = ?self.domains,
            directory = %self.directory_url,
            "Creating ACME order"
        );
        let mut order = self.account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut published_tokens = Vec::new();
        let result = Self::drive_order(&mut order, challenges, &mut published_tokens).await;

        for token in &published_tokens {
            challenges.remove(token);
        }

        result
    }

    /// Satisfy the order's authorizations and pull down the certificate.
    async fn drive_order(
        order: &mut Order,
        challenges: &WebrootChallenges,
        published_tokens: &mut Vec<String>,
    ) -> Result<IssuedCertificate, AcmeError> {
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result?;
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::Authorization(format!(
                        "unexpected authorization status: {status:?}"
                    )))
                }
            }

            let mut challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or(AcmeError::NoHttp01Challenge)?;

            let key_authorization = challenge.key_authorization();
            challenges.publish(&challenge.token, key_authorization.as_str())?;
            published_tokens.push(challenge.token.clone());

            challenge.set_ready().await?;
        }
        drop(authorizations);

        let status = order.poll_ready(&RetryPolicy::default()).await?;
        if status != OrderStatus::Ready {
            return Err(AcmeError::OrderState(format!("{status:?}")));
        }

        // finalize() generates the key pair and CSR internally.
        let privkey_pem = order.finalize().await?;
        let fullchain_pem = order.poll_certificate(&RetryPolicy::default()).await?;

        let meta = parse_leaf_metadata(&fullchain_pem)
            .map_err(|e| AcmeError::OrderState(format!("issued certificate does not parse: {e}")))?;
        let chain_pem = split_chain(&fullchain_pem)
            .map_err(|e| AcmeError::OrderState(format!("issued chain does not parse: {e}")))?;

        info!(
            expires = %meta.not_after,
            issuer = %meta.issuer,
            "Certificate issued"
        );

        Ok(IssuedCertificate {
            fullchain_pem,
            privkey_pem,
            chain_pem,
            meta,
        })
    }
}

fn ensure_private_dir(path: &Path) -> Result<(), AcmeError> {
    fs::create_dir_all(path).map_err(|source| AcmeError::Storage {
        path: path.to_path_buf(),
        source,
    })?;

    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|source| {
        AcmeError::Storage {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn load_credentials(path: &PathBuf) -> Result<Option<AccountCredentials>, AcmeError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(AcmeError::Storage {
                path: path.clone(),
                source,
            })
        }
    };

    match serde_json::from_str(&content) {
        Ok(credentials) => Ok(Some(credentials)),
        Err(e) => {
            // A corrupt credentials file is recoverable: register afresh.
            warn!(
                path = %path.display(),
                error = %e,
                "Stored ACME credentials do not parse, re-registering account"
            );
            Ok(None)
        }
    }
}

fn save_credentials(path: &PathBuf, credentials: &AccountCredentials) -> Result<(), AcmeError> {
    let content = serde_json::to_string_pretty(credentials)?;
    fs::write(path, content).map_err(|source| AcmeError::Storage {
        path: path.clone(),
        source,
    })?;

    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        AcmeError::Storage {
            path: path.clone(),
            source,
        }
    })?;

    info!(path = %path.display(), "Saved ACME account credentials");
    Ok(())
}
