use serde::{Deserialize, Serialize};

/// Error codes whose parameter payload comes from a storage backend driver.
const SR_BACKEND_PREFIX: &str = "SR_BACKEND_FAILURE";

/// A classified remote failure: the raw (code, parameters) pair from the
/// control plane plus a rendered message and a short form for dense UIs.
///
/// Decoding is total: any input, including empty or malformed parameter
/// lists, produces a non-empty message. It never fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub code: String,
    /// The full ordered error description, code at index 0.
    pub params: Vec<String>,
    pub message: String,
    pub short_message: String,
}

impl Failure {
    /// Decode a raw error description as reported by the control plane:
    /// element 0 is the error code, the rest are positional parameters.
    pub fn from_error_info(info: &[String]) -> Self {
        let code = info
            .first()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "UNKNOWN_ERROR".to_string());

        let message = render_message(&code, info);
        let short_message = match template(&format!("{code}-SHORT")) {
            Some(t) => substitute(t, info),
            None => message.clone(),
        };

        Failure {
            code,
            params: info.to_vec(),
            message,
            short_message,
        }
    }

    /// Convenience constructor used where the code and parameters arrive
    /// separately.
    pub fn new(code: &str, params: &[&str]) -> Self {
        let mut info = Vec::with_capacity(params.len() + 1);
        info.push(code.to_string());
        info.extend(params.iter().map(|p| p.to_string()));
        Self::from_error_info(&info)
    }

    /// First line of the rendered message.
    pub fn first_line(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn render_message(code: &str, info: &[String]) -> String {
    if code.starts_with(SR_BACKEND_PREFIX) {
        if let Some(msg) = backend_payload_message(code, info) {
            return msg;
        }
    }

    if let Some(t) = template(code) {
        return substitute(t, info);
    }

    join_params(info).unwrap_or_else(|| code.to_string())
}

/// Storage backend failures smuggle a structured payload in parameter 2:
/// either a JSON object with an `error` field, or a driver fault report
/// carrying an XML `<faultstring>` fragment.
fn backend_payload_message(code: &str, info: &[String]) -> Option<String> {
    let payload = info.get(2)?;

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
            if !err.is_empty() {
                return Some(err.to_string());
            }
        }
    }

    if let Some(fault) = extract_fault_text(payload) {
        let base = join_params(info).unwrap_or_else(|| code.to_string());
        return Some(format!("{base}: {fault}"));
    }

    None
}

fn extract_fault_text(payload: &str) -> Option<&str> {
    let start = payload.find("<faultstring>")? + "<faultstring>".len();
    let end = payload[start..].find("</faultstring>")? + start;
    let fault = payload[start..end].trim();
    if fault.is_empty() { None } else { Some(fault) }
}

/// Substitute `{0}`, `{1}`, ... from the parameters following the code.
/// Missing parameters render as empty strings.
fn substitute(template: &str, info: &[String]) -> String {
    let mut out = template.to_string();
    // Templates in the table use at most a handful of placeholders.
    for i in 0..8 {
        let placeholder = format!("{{{i}}}");
        if out.contains(&placeholder) {
            let value = info.get(i + 1).map(String::as_str).unwrap_or("");
            out = out.replace(&placeholder, value);
        }
    }
    out
}

fn join_params(info: &[String]) -> Option<String> {
    let joined = info
        .iter()
        .skip(1)
        .filter(|p| !p.trim().is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" - ");
    if joined.is_empty() { None } else { Some(joined) }
}

/// Format templates for known error codes. Codes the client reasons about
/// get bespoke, actionable text; everything else falls back to the generic
/// parameter join.
fn template(code: &str) -> Option<&'static str> {
    let t = match code {
        "NO_HOSTS_AVAILABLE" => "No servers are available to run this VM",
        "NO_HOSTS_AVAILABLE-SHORT" => "No servers available",
        "HA_OPERATION_WOULD_BREAK_FAILOVER_PLAN" => {
            "This operation would leave the pool unable to guarantee its HA failover plan"
        }
        "HA_OPERATION_WOULD_BREAK_FAILOVER_PLAN-SHORT" => "Would break HA failover plan",
        "HOST_NOT_ENOUGH_FREE_MEMORY" => {
            "The destination server does not have enough free memory ({0} needed, {1} available)"
        }
        "HOST_NOT_ENOUGH_FREE_MEMORY-SHORT" => "Not enough server memory",
        "VM_REQUIRES_SR" => {
            "The VM requires access to storage repository '{1}', which cannot be reached from the destination server"
        }
        "VM_REQUIRES_SR-SHORT" => "Storage not reachable from destination",
        "VM_REQUIRES_NETWORK" => {
            "The VM requires access to network '{1}', which is not available on the destination server"
        }
        "VIF_NOT_IN_MAP" => "Network interface '{0}' was not assigned a destination network",
        "VM_BAD_POWER_STATE" => "The VM is in the wrong power state for this operation (expected {1}, found {2})",
        "VM_BAD_POWER_STATE-SHORT" => "Wrong power state",
        "HOST_DISABLED" => "The destination server is disabled and cannot receive VMs",
        "OPERATION_NOT_ALLOWED" => "This operation is not allowed: {0}",
        "NOT_IMPLEMENTED" => "The server does not support '{0}'",
        "RBAC_PERMISSION_DENIED" => {
            "You do not have permission to perform this operation ({0})\nContact your pool administrator to request the role required for '{0}'"
        }
        "RBAC_PERMISSION_DENIED-SHORT" => "Permission denied",
        "SR_FULL" => "The storage repository does not have enough free space ({0} required, {1} available)",
        "CANNOT_CONTACT_HOST" => "The destination server cannot be contacted",
        "LICENCE_RESTRICTION" => "The requested feature '{0}' is not covered by the server licence",
        _ => return None,
    };
    Some(t)
}
