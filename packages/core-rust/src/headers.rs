//! Well-known transport message header names.

/// Logical endpoint name of the instance that processed a message.
pub const PROCESSING_ENDPOINT: &str = "Unicast.ProcessingEndpoint";

/// Machine name of the instance that processed a message.
pub const PROCESSING_MACHINE: &str = "Unicast.ProcessingMachine";

/// Numeric code carried by a control reply produced by `Return`.
pub const RETURN_MESSAGE_ERROR_CODE: &str = "Unicast.ReturnMessage.ErrorCode";

/// Marks a message that carries no body and exists only for its headers.
pub const CONTROL_MESSAGE: &str = "Unicast.ControlMessage";

/// Comma-separated site keys a gateway should forward the message to.
pub const DESTINATION_SITES: &str = "Unicast.DestinationSites";
