//! Resource discovery.
//!
//! Plugins treat discovery as an ordered list of resource strings. USB-attached
//! sourcemeters are the common bench setup, so the first USB address is moved to
//! the front and becomes the default selection.

use crate::error::Result;
use crate::transport::visa;

/// Move the first address starting with `USB` to the front, keeping the
/// relative order of everything else.
#[must_use]
pub fn order_resources(mut resources: Vec<String>) -> Vec<String> {
    if let Some(index) = resources.iter().position(|r| r.starts_with("USB")) {
        let usb = resources.remove(index);
        resources.insert(0, usb);
    }
    resources
}

/// Enumerate VISA resources in display order.
///
/// Without the `instrument_visa` feature the list is empty.
pub async fn list_resources() -> Result<Vec<String>> {
    let found = visa::find_resources().await?;
    tracing::debug!("Discovered {} VISA resources", found.len());
    Ok(order_resources(found))
}

/// First resource in display order, if any.
pub async fn default_resource() -> Result<Option<String>> {
    Ok(list_resources().await?.into_iter().next())
}
