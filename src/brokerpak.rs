//! Engine release resolution.
//!
//! Works out which URL to fetch the provisioning-engine binary from, given
//! its name, version, and the target platform. Operators may override the
//! default HashiCorp releases template with their own URL template or a
//! local path (mirrored artifacts for air-gapped installs).

use std::path::Path;

use serde::{Deserialize, Serialize};

pub const HASHICORP_URL_TEMPLATE: &str =
    "https://releases.hashicorp.com/${name}/${version}/${name}_${version}_${os}_${arch}.zip";

/// Target platform for an engine binary download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        Platform {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Resolve the download URL for an engine release.
///
/// An empty `url_template` selects the HashiCorp default; a URL template is
/// used as-is; anything else is treated as a local path and made absolute.
pub fn release_url(name: &str, version: &str, url_template: &str, platform: &Platform) -> String {
    let template = if url_template.is_empty() {
        HASHICORP_URL_TEMPLATE.to_string()
    } else if is_url(url_template) {
        url_template.to_string()
    } else {
        std::path::absolute(Path::new(url_template))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| url_template.to_string())
    };

    template
        .replace("${name}", name)
        .replace("${version}", version)
        .replace("${os}", &platform.os)
        .replace("${arch}", &platform.arch)
}

fn is_url(candidate: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(parsed) => !parsed.scheme().is_empty() && parsed.has_host(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_amd64() -> Platform {
        Platform {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        }
    }

    #[test]
    fn default_template_targets_hashicorp_releases() {
        let url = release_url("terraform", "1.6.0", "", &linux_amd64());
        assert_eq!(
            url,
            "https://releases.hashicorp.com/terraform/1.6.0/terraform_1.6.0_linux_amd64.zip"
        );
    }

    #[test]
    fn custom_url_template_is_substituted() {
        let url = release_url(
            "terraform",
            "1.6.0",
            "https://mirror.example.com/${name}-${version}-${os}-${arch}.zip",
            &linux_amd64(),
        );
        assert_eq!(
            url,
            "https://mirror.example.com/terraform-1.6.0-linux-amd64.zip"
        );
    }

    #[test]
    fn local_path_template_is_made_absolute() {
        let resolved = release_url(
            "terraform",
            "1.6.0",
            "mirrors/${name}_${version}.zip",
            &linux_amd64(),
        );
        assert!(Path::new(&resolved).is_absolute());
        assert!(resolved.ends_with("mirrors/terraform_1.6.0.zip"));
    }

    #[test]
    fn bare_words_are_not_urls() {
        assert!(!is_url("mirrors/terraform.zip"));
        assert!(!is_url(""));
        assert!(is_url("https://example.com/terraform.zip"));
    }
}
