//! USDT (BEP-20) on-chain transfer interface, shared by the Settlement and
//! Payout Engines (spec §4.4, §4.5) to submit the actual sweep/payout transfer.

use alloy::sol;

sol! {
    /// Standard ERC20 interface (BEP-20 is ERC20-compatible).
    #[sol(rpc)]
    contract ERC20 {
        function decimals() external view returns (uint8);
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}
