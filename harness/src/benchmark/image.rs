//! Per-benchmark container image naming.

use super::BenchmarkKind;

/// DockerHub account hosting the swebenchpro image mirror.
const SWEBENCHPRO_DOCKERHUB_USER: &str = "jefzda";

/// DockerHub tags cap out at 128 characters.
const MAX_TAG_LEN: usize = 128;

/// Repo-name overrides for ids whose image tags do not follow the default
/// scheme. Keyed by full instance id.
const REPO_TAG_OVERRIDES: &[(&str, &str)] = &[(
    "instance_element-hq__element-web-ec0f940ef0e8e3b61078f145f34dc40d1938e6c5-vnan",
    "element-web",
)];

/// Resolve the image reference for an instance.
///
/// - swebench: `docker.io/swebench/sweb.eval.x86_64.<id>:latest` where the
///   id's `__` separator becomes the registry-safe `_1776_` token.
/// - swebenchpro: `<user>/sweap-images:<repo_base>.<repo_name>-<hash>`, with
///   the `instance_` prefix and any `-vnan` suffix stripped from the hash and
///   a table of per-id repo-name overrides.
pub fn image_uri(benchmark: BenchmarkKind, instance_id: &str, repo: &str) -> String {
    match benchmark {
        BenchmarkKind::Swebench => {
            let id_docker_compatible = instance_id.replace("__", "_1776_");
            format!("docker.io/swebench/sweb.eval.x86_64.{id_docker_compatible}:latest")
                .to_lowercase()
        }
        BenchmarkKind::Swebenchpro => {
            let repo_lower = repo.to_lowercase();
            let (repo_base, repo_name) = repo_lower.split_once('/').unwrap_or((repo_lower.as_str(), ""));
            let mut hash = instance_id
                .strip_prefix("instance_")
                .unwrap_or(instance_id)
                .to_string();

            let override_name = REPO_TAG_OVERRIDES
                .iter()
                .find(|(id, _)| *id == instance_id)
                .map(|(_, name)| name.to_string());

            let repo_name = match override_name {
                Some(name) => name,
                None => {
                    if hash.ends_with("-vnan") {
                        hash.truncate(hash.len() - "-vnan".len());
                    }
                    if repo_base == "element-hq" && repo_name.contains("element-web") {
                        "element".to_string()
                    } else {
                        repo_name.to_string()
                    }
                }
            };

            let mut tag = format!("{repo_base}.{repo_name}-{hash}");
            tag.truncate(MAX_TAG_LEN);
            format!("{SWEBENCHPRO_DOCKERHUB_USER}/sweap-images:{tag}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swebench_image_name() {
        assert_eq!(
            image_uri(BenchmarkKind::Swebench, "django__django-11141", "django/django"),
            "docker.io/swebench/sweb.eval.x86_64.django_1776_django-11141:latest"
        );
    }

    #[test]
    fn test_swebenchpro_strips_prefix_and_vnan() {
        let uri = image_uri(
            BenchmarkKind::Swebenchpro,
            "instance_gravitational__teleport-c7828-vnan",
            "gravitational/teleport",
        );
        assert_eq!(
            uri,
            "jefzda/sweap-images:gravitational.teleport-gravitational__teleport-c7828"
        );
    }

    #[test]
    fn test_override_table_wins_over_suffix_stripping() {
        let uri = image_uri(
            BenchmarkKind::Swebenchpro,
            "instance_element-hq__element-web-ec0f940ef0e8e3b61078f145f34dc40d1938e6c5-vnan",
            "element-hq/element-web",
        );
        // The overridden id keeps its full repo name and its -vnan suffix.
        assert!(uri.contains("element-hq.element-web-"));
        assert!(uri.ends_with("-vnan"));
    }

    #[test]
    fn test_element_family_collapses_repo_name() {
        let uri = image_uri(
            BenchmarkKind::Swebenchpro,
            "instance_element-hq__element-web-0123abc-vnan",
            "element-hq/element-web",
        );
        assert!(uri.contains("element-hq.element-"));
        assert!(!uri.ends_with("-vnan"));
    }

    #[test]
    fn test_tag_capped_at_128() {
        let long_id = format!("instance_org__repo-{}", "a".repeat(200));
        let uri = image_uri(BenchmarkKind::Swebenchpro, &long_id, "org/repo");
        let tag = uri.split(':').next_back().unwrap();
        assert_eq!(tag.len(), 128);
    }
}
