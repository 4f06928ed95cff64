use crate::image_reference::ImageReference;
use k8s_openapi::api::core::v1::PodSpec;
use tracing::debug;

static PROXY_PATH_SEGMENT: &str = "proxy";

/// Rewrites `image` so that it is pulled through the application's proxy registry.
///
/// Only the repository survives; the proxy resolves tags and digests itself.
/// Inputs are joined as-is, so a malformed reference still produces a URL.
pub fn resolve(proxy_host: &str, app_slug: &str, image: &str) -> String {
    let reference = ImageReference::parse(image);
    let proxied = [
        proxy_host,
        PROXY_PATH_SEGMENT,
        app_slug,
        reference.repository(),
    ]
    .join("/");
    debug!("Rewrote image {} to proxied image {}", image, proxied);
    proxied
}

/// The proxy registry of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRegistry {
    pub host: String,
    pub app_slug: String,
}

impl ProxyRegistry {
    pub fn new(host: impl Into<String>, app_slug: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            app_slug: app_slug.into(),
        }
    }

    pub fn resolve(&self, image: &str) -> String {
        resolve(&self.host, &self.app_slug, image)
    }

    /// Points every container and init container of `spec` at the proxy.
    /// Returns the number of images rewritten.
    pub fn rewrite_pod_spec(&self, spec: &mut PodSpec) -> usize {
        let init_containers = spec.init_containers.iter_mut().flatten();
        let mut rewritten = 0;
        for container in spec.containers.iter_mut().chain(init_containers) {
            if let Some(image) = container.image.as_mut() {
                *image = self.resolve(image);
                rewritten += 1;
            }
        }
        rewritten
    }
}
