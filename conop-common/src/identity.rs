//! The identity object, CiA 301 object 0x1018
//!
//! Every CANopen node implements this object: it reports the vendor, the product, a
//! revision, and a serial number, and is the usual first thing a scanner reads off a
//! freshly discovered node.

/// The four sub-objects of the identity object (0x1018)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// Sub 1: a CiA-assigned vendor ID
    pub vendor_id: u32,
    /// Sub 2: vendor-specific product code
    pub product_code: u32,
    /// Sub 3: vendor-specific revision number
    pub revision_number: u32,
    /// Sub 4: vendor-specific serial number
    pub serial_number: u32,
}

impl Identity {
    /// Build an [`Identity`] from the four sub-object values
    pub fn new(vendor_id: u32, product_code: u32, revision_number: u32, serial_number: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision_number,
            serial_number,
        }
    }
}
