use ethers::abi::{parse_abi, Abi};

use crate::error::{SyncError, SyncResult};

const DEX_ABI: &[&str] = &[
    "function getTokens() external view returns ((bytes32,address)[])",
    "function getOrders(bytes32 ticker, uint8 side) external view returns ((uint256,address,uint8,bytes32,uint256,uint256,uint256,uint256)[])",
    "function traderBalances(address trader, bytes32 ticker) external view returns (uint256)",
    "function deposit(uint256 amount, bytes32 ticker) external",
    "function withdraw(uint256 amount, bytes32 ticker) external",
    "function createLimitOrder(bytes32 ticker, uint256 amount, uint256 price, uint8 side) external",
    "function createMarketOrder(bytes32 ticker, uint256 amount, uint8 side) external",
    "event NewTrade(uint256 tradeId, uint256 orderId, bytes32 indexed ticker, address indexed trader1, address indexed trader2, uint256 amount, uint256 price, uint256 date)",
];

const ERC20_ABI: &[&str] = &[
    "function balanceOf(address owner) external view returns (uint256)",
    "function allowance(address owner, address spender) external view returns (uint256)",
    "function approve(address spender, uint256 amount) external returns (bool)",
    "event Transfer(address indexed from, address indexed to, uint256 value)",
];

pub fn dex_abi() -> SyncResult<Abi> {
    parse_abi(DEX_ABI).map_err(|e| SyncError::Config(format!("dex abi: {e}")))
}

pub fn erc20_abi() -> SyncResult<Abi> {
    parse_abi(ERC20_ABI).map_err(|e| SyncError::Config(format!("erc20 abi: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abis_parse() {
        let dex = dex_abi().unwrap();
        assert!(dex.function("getOrders").is_ok());
        assert_eq!(dex.event("NewTrade").unwrap().inputs.len(), 8);

        let erc20 = erc20_abi().unwrap();
        assert!(erc20.function("balanceOf").is_ok());
        assert_eq!(erc20.event("Transfer").unwrap().inputs.len(), 3);
    }
}
