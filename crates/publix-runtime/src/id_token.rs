//! Identity token codec.
//!
//! The token is the client's only proof of where it stands in a study:
//! worker, batch, study, run, group, component, component-run and the
//! component's position. It is a `key=value&...` string in a fixed field
//! order, base64url encoded and signed with HMAC-SHA256:
//!
//! ```text
//! base64url(workerId=1&batchId=2&...&componentPos=1) "." base64url(hmac)
//! ```
//!
//! A run without a group carries the literal `groupResultId=null`; a token
//! lacking the field altogether is malformed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use publix_kernel::{
    BatchId, ComponentId, ComponentRunId, GroupId, RunId, StudyId, WorkerId,
};

type HmacSha256 = Hmac<Sha256>;

const WORKER_ID: &str = "workerId";
const BATCH_ID: &str = "batchId";
const STUDY_ID: &str = "studyId";
const RUN_ID: &str = "studyResultId";
const GROUP_ID: &str = "groupResultId";
const COMPONENT_ID: &str = "componentId";
const COMPONENT_RUN_ID: &str = "componentResultId";
const COMPONENT_POS: &str = "componentPos";
const NO_GROUP: &str = "null";

const FIELDS: [&str; 8] = [
    WORKER_ID,
    BATCH_ID,
    STUDY_ID,
    RUN_ID,
    GROUP_ID,
    COMPONENT_ID,
    COMPONENT_RUN_ID,
    COMPONENT_POS,
];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdTokenError {
    #[error("identity token signature mismatch")]
    Signature,
    #[error("malformed identity token: {0}")]
    Malformed(String),
    #[error("identity token key rejected")]
    Key,
}

/// Decoded ancestry of a run's current position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdToken {
    pub worker_id: WorkerId,
    pub batch_id: BatchId,
    pub study_id: StudyId,
    pub run_id: RunId,
    pub group_id: Option<GroupId>,
    pub component_id: ComponentId,
    pub component_run_id: ComponentRunId,
    /// 1-based position of the component in the study.
    pub component_position: usize,
}

impl IdToken {
    fn to_query(&self) -> String {
        let group = self
            .group_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| NO_GROUP.to_string());
        format!(
            "{WORKER_ID}={}&{BATCH_ID}={}&{STUDY_ID}={}&{RUN_ID}={}&{GROUP_ID}={}&{COMPONENT_ID}={}&{COMPONENT_RUN_ID}={}&{COMPONENT_POS}={}",
            self.worker_id,
            self.batch_id,
            self.study_id,
            self.run_id,
            group,
            self.component_id,
            self.component_run_id,
            self.component_position
        )
    }

    fn from_query(query: &str) -> Result<Self, IdTokenError> {
        let mut values: [Option<&str>; 8] = [None; 8];
        for pair in query.split('&') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| IdTokenError::Malformed(format!("pair '{}' has no value", pair)))?;
            let index = FIELDS
                .iter()
                .position(|field| *field == key)
                .ok_or_else(|| IdTokenError::Malformed(format!("unknown field '{}'", key)))?;
            if values[index].replace(value).is_some() {
                return Err(IdTokenError::Malformed(format!("duplicate field '{}'", key)));
            }
        }
        let field = |index: usize| -> Result<&str, IdTokenError> {
            values[index]
                .ok_or_else(|| IdTokenError::Malformed(format!("missing field '{}'", FIELDS[index])))
        };
        let group_raw = field(4)?;
        let group_id = if group_raw == NO_GROUP {
            None
        } else {
            Some(parse_u64(GROUP_ID, group_raw)?)
        };
        let position = parse_u64(COMPONENT_POS, field(7)?)?;
        Ok(Self {
            worker_id: parse_u64(WORKER_ID, field(0)?)?,
            batch_id: parse_u64(BATCH_ID, field(1)?)?,
            study_id: parse_u64(STUDY_ID, field(2)?)?,
            run_id: parse_u64(RUN_ID, field(3)?)?,
            group_id,
            component_id: parse_u64(COMPONENT_ID, field(5)?)?,
            component_run_id: parse_u64(COMPONENT_RUN_ID, field(6)?)?,
            component_position: usize::try_from(position).map_err(|_| {
                IdTokenError::Malformed(format!("{} out of range", COMPONENT_POS))
            })?,
        })
    }
}

fn parse_u64(field: &str, raw: &str) -> Result<u64, IdTokenError> {
    raw.parse::<u64>()
        .map_err(|_| IdTokenError::Malformed(format!("field '{}' is not a number: '{}'", field, raw)))
}

/// Signs and verifies identity tokens with a process-wide secret.
#[derive(Clone)]
pub struct IdTokenCodec {
    secret: Vec<u8>,
}

impl std::fmt::Debug for IdTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdTokenCodec").finish_non_exhaustive()
    }
}

impl IdTokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Codec with a random 32-byte secret; tokens do not survive a restart.
    pub fn random() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256, IdTokenError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| IdTokenError::Key)
    }

    pub fn encode(&self, token: &IdToken) -> Result<String, IdTokenError> {
        self.sign_raw(&token.to_query())
    }

    pub fn decode(&self, raw: &str) -> Result<IdToken, IdTokenError> {
        let (payload, signature) = raw
            .trim()
            .split_once('.')
            .ok_or_else(|| IdTokenError::Malformed("missing signature".to_string()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| IdTokenError::Signature)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| IdTokenError::Signature)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| IdTokenError::Malformed(format!("payload is not base64url: {}", e)))?;
        let query = String::from_utf8(bytes)
            .map_err(|_| IdTokenError::Malformed("payload is not utf-8".to_string()))?;
        IdToken::from_query(&query)
    }

    /// Signs an arbitrary payload; lets callers craft tokens with a valid
    /// signature but hand-built content.
    pub fn sign_raw(&self, query: &str) -> Result<String, IdTokenError> {
        let payload = URL_SAFE_NO_PAD.encode(query);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }
}
