//! Bindings for the destination contracts the relay mutates. Only the entry
//! points the relay calls are declared; events are decoded elsewhere from
//! raw logs.

use ethers::prelude::abigen;

abigen!(
    MessageVerifier,
    r#"[
        function submitAttestation(bytes32 messageId) external
        function verifyMessage(uint32 srcEid, bytes32 sender, uint64 nonce, address receiver, bytes32 payloadHash) external
    ]"#
);

abigen!(
    MessageExecutor,
    r#"[
        function execute(bytes32 messageId) external
    ]"#
);
